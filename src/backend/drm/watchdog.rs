//! Detection of commits that never complete
//!
//! Every asynchronous commit arms a watchdog for its output, the completion event disarms it.
//! A driver that loses a page-flip leaves the compositor waiting forever, so
//! [`CalloopWatchdog`] treats an expired timer as fatal and stops the event loop.

use std::{
    cell::Cell,
    collections::HashMap,
    fmt,
    rc::Rc,
    time::Duration,
};

use calloop::{
    timer::{TimeoutAction, Timer},
    LoopHandle, LoopSignal, RegistrationToken,
};
use tracing::{error, trace, warn};

use super::OutputId;

/// Timer started for every commit in flight
pub trait PageflipWatchdog {
    /// Starts (or restarts) the timer of an output
    fn arm(&mut self, output: OutputId, name: &str, timeout: Duration);
    /// Stops the timer of an output
    fn disarm(&mut self, output: OutputId);
}

/// Watchdog that never fires
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl PageflipWatchdog for NoWatchdog {
    fn arm(&mut self, _output: OutputId, _name: &str, _timeout: Duration) {}
    fn disarm(&mut self, _output: OutputId) {}
}

impl<W: PageflipWatchdog + ?Sized> PageflipWatchdog for Box<W> {
    fn arm(&mut self, output: OutputId, name: &str, timeout: Duration) {
        (**self).arm(output, name, timeout)
    }

    fn disarm(&mut self, output: OutputId) {
        (**self).disarm(output)
    }
}

/// Watchdog backed by calloop timers
///
/// On expiry the loop is stopped through its [`LoopSignal`] and [`CalloopWatchdog::exit_code`]
/// reports `1`.
pub struct CalloopWatchdog<Data: 'static> {
    handle: LoopHandle<'static, Data>,
    signal: LoopSignal,
    timers: HashMap<OutputId, RegistrationToken>,
    exit_code: Rc<Cell<Option<i32>>>,
}

impl<Data: 'static> fmt::Debug for CalloopWatchdog<Data> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalloopWatchdog")
            .field("timers", &self.timers)
            .field("exit_code", &self.exit_code.get())
            .finish_non_exhaustive()
    }
}

impl<Data: 'static> CalloopWatchdog<Data> {
    /// Creates a watchdog inserting its timers into the given loop
    pub fn new(handle: LoopHandle<'static, Data>, signal: LoopSignal) -> Self {
        CalloopWatchdog {
            handle,
            signal,
            timers: HashMap::new(),
            exit_code: Rc::new(Cell::new(None)),
        }
    }

    /// Exit code requested by an expired timer
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    /// Shared view of the exit code, usable after the watchdog was handed to the backend
    pub fn exit_code_handle(&self) -> Rc<Cell<Option<i32>>> {
        self.exit_code.clone()
    }
}

impl<Data: 'static> PageflipWatchdog for CalloopWatchdog<Data> {
    fn arm(&mut self, output: OutputId, name: &str, timeout: Duration) {
        self.disarm(output);

        let signal = self.signal.clone();
        let exit_code = self.exit_code.clone();
        let name = name.to_string();
        let timer = Timer::from_duration(timeout);
        match self.handle.insert_source(timer, move |_, _, _| {
            error!(
                output = %name,
                "Pageflip timed out after {} ms, this is a driver bug",
                timeout.as_millis()
            );
            exit_code.set(Some(1));
            signal.stop();
            signal.wakeup();
            TimeoutAction::Drop
        }) {
            Ok(token) => {
                trace!(?output, "Armed pageflip watchdog");
                self.timers.insert(output, token);
            }
            Err(err) => warn!(?output, "Failed to arm pageflip watchdog: {}", err),
        }
    }

    fn disarm(&mut self, output: OutputId) {
        if let Some(token) = self.timers.remove(&output) {
            self.handle.remove(token);
        }
    }
}
