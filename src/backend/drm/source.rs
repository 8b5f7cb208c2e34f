use std::io;

use calloop::{
    generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory,
};
use tracing::trace;

use super::DrmDeviceFd;

/// Event source signaling pending completion events on a drm device
///
/// The device fd is polled level-triggered. Every time it becomes readable the callback is
/// invoked, which should call [`DrmBackend::dispatch_kms_events`](super::DrmBackend::dispatch_kms_events)
/// and then drain the queued [`BackendEvent`](super::BackendEvent)s:
///
/// ```no_run
/// # use scanout::backend::drm::{DrmBackend, DrmDevice, DrmDeviceFd, DrmNotifier, DumbRenderPath};
/// # fn run(fd: DrmDeviceFd, backend: DrmBackend<DrmDevice, DumbRenderPath>) {
/// let mut event_loop = calloop::EventLoop::<DrmBackend<DrmDevice, DumbRenderPath>>::try_new().unwrap();
/// event_loop
///     .handle()
///     .insert_source(DrmNotifier::new(fd), |(), _, backend| {
///         if let Err(err) = backend.dispatch_kms_events() {
///             eprintln!("{}", err);
///         }
///         for event in backend.take_events() {
///             // schedule repaints, send presentation feedback, ...
///         }
///     })
///     .unwrap();
/// # }
/// ```
#[derive(Debug)]
pub struct DrmNotifier {
    source: Generic<DrmDeviceFd>,
}

impl DrmNotifier {
    /// Creates a source for the given device
    pub fn new(fd: DrmDeviceFd) -> Self {
        DrmNotifier {
            source: Generic::new(fd, Interest::READ, Mode::Level),
        }
    }
}

impl EventSource for DrmNotifier {
    type Event = ();
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        self.source.process_events(readiness, token, |_, _| {
            trace!("Drm device readable");
            callback((), &mut ());
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}
