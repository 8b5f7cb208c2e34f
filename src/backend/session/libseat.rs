//!
//! Implementation of the [`Session`](crate::backend::session::Session) trait through the libseat.
//!
//! This requires libseat to be available on the system.

use libseat::{Seat, SeatEvent};
use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd},
    path::Path,
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use calloop::{
    generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory,
};
use rustix::fs::OFlags;
use tracing::{debug, error, info_span, warn};

use crate::backend::session::{Event as SessionEvent, Session};

fn errno(err: libseat::Errno) -> io::Error {
    io::Error::from_raw_os_error(err.0)
}

struct LibSeatSessionImpl {
    seat: RefCell<Seat>,
    active: Arc<AtomicBool>,
    devices: RefCell<HashMap<RawFd, libseat::Device>>,
    span: tracing::Span,
}

impl std::fmt::Debug for LibSeatSessionImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibSeatSessionImpl")
            .field("active", &self.active)
            .field("devices", &self.devices.borrow().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Drop for LibSeatSessionImpl {
    fn drop(&mut self) {
        debug!(parent: &self.span, "Closing seat")
    }
}

/// [`Session`] via the libseat
#[derive(Debug, Clone)]
pub struct LibSeatSession {
    internal: Weak<LibSeatSessionImpl>,
    seat_name: String,
}

/// Event source of a [`LibSeatSession`]
///
/// Yields [`SessionEvent::PauseSession`] and [`SessionEvent::ActivateSession`].
#[derive(Debug)]
pub struct LibSeatSessionNotifier {
    internal: Rc<LibSeatSessionImpl>,
    queue: Rc<RefCell<Vec<SessionEvent>>>,
    source: Generic<OwnedFd>,
}

impl LibSeatSession {
    /// Tries to create a new session via libseat.
    pub fn new() -> Result<(LibSeatSession, LibSeatSessionNotifier), Error> {
        let span = info_span!("backend_session", session_type = "libseat");
        let _guard = span.enter();

        let active = Arc::new(AtomicBool::new(false));
        let queue = Rc::new(RefCell::new(Vec::new()));

        let mut seat = {
            let active = active.clone();
            let queue = queue.clone();
            let span = span.clone();
            Seat::open(move |seat, event| {
                let _guard = span.enter();
                match event {
                    SeatEvent::Enable => {
                        debug!("Enable callback called");
                        active.store(true, Ordering::SeqCst);
                        queue.borrow_mut().push(SessionEvent::ActivateSession);
                    }
                    SeatEvent::Disable => {
                        debug!("Disable callback called");
                        active.store(false, Ordering::SeqCst);
                        queue.borrow_mut().push(SessionEvent::PauseSession);
                        if let Err(err) = seat.disable() {
                            error!("Failed to acknowledge session pause: {}", errno(err));
                        }
                    }
                }
            })
            .map_err(|err| Error::FailedToOpenSession(errno(err)))?
        };

        // The seat is often enabled right away, pick that up before the first dispatch
        if let Err(err) = seat.dispatch(0) {
            warn!("Initial seat dispatch failed: {}", errno(err));
        }

        let fd = seat
            .get_fd()
            .map_err(errno)
            .and_then(|fd| fd.try_clone_to_owned())
            .map_err(Error::FailedToOpenSession)?;
        let seat_name = seat.name().to_owned();

        drop(_guard);
        let internal = Rc::new(LibSeatSessionImpl {
            seat: RefCell::new(seat),
            active,
            devices: RefCell::new(HashMap::new()),
            span,
        });

        Ok((
            LibSeatSession {
                internal: Rc::downgrade(&internal),
                seat_name,
            },
            LibSeatSessionNotifier {
                internal,
                queue,
                source: Generic::new(fd, Interest::READ, Mode::Level),
            },
        ))
    }
}

impl Session for LibSeatSession {
    type Error = Error;

    fn open(&mut self, path: &Path, _flags: OFlags) -> Result<OwnedFd, Self::Error> {
        let session = self.internal.upgrade().ok_or(Error::SessionLost)?;
        debug!(parent: &session.span, "Opening device: {:?}", path);

        let device = session
            .seat
            .borrow_mut()
            .open_device(&path)
            .map_err(|err| Error::Seat(errno(err)))?;
        let fd = match device.as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(err) => {
                if let Err(close_err) = session.seat.borrow_mut().close_device(device) {
                    warn!(parent: &session.span, "Failed to close device: {}", errno(close_err));
                }
                return Err(Error::Seat(err));
            }
        };
        session.devices.borrow_mut().insert(fd.as_raw_fd(), device);
        Ok(fd)
    }

    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error> {
        let session = self.internal.upgrade().ok_or(Error::SessionLost)?;
        debug!(parent: &session.span, "Closing device: {:?}", fd);

        let device = session.devices.borrow_mut().remove(&fd.as_raw_fd());
        drop(fd);
        if let Some(device) = device {
            session
                .seat
                .borrow_mut()
                .close_device(device)
                .map_err(|err| Error::Seat(errno(err)))?;
        }
        Ok(())
    }

    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error> {
        let session = self.internal.upgrade().ok_or(Error::SessionLost)?;
        debug!(parent: &session.span, "Session switch: {:?}", vt);
        session
            .seat
            .borrow_mut()
            .switch_session(vt)
            .map_err(|err| Error::Seat(errno(err)))
    }

    fn is_active(&self) -> bool {
        self.internal
            .upgrade()
            .map_or(false, |internal| internal.active.load(Ordering::SeqCst))
    }

    fn seat(&self) -> String {
        self.seat_name.clone()
    }
}

impl LibSeatSessionNotifier {
    /// Creates a new session object belonging to this notifier.
    pub fn session(&self) -> LibSeatSession {
        LibSeatSession {
            internal: Rc::downgrade(&self.internal),
            seat_name: self.internal.seat.borrow_mut().name().to_owned(),
        }
    }
}

impl EventSource for LibSeatSessionNotifier {
    type Event = SessionEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let internal = &self.internal;
        self.source.process_events(readiness, token, |_, _| {
            internal.seat.borrow_mut().dispatch(0).map_err(errno)?;
            Ok(PostAction::Continue)
        })?;

        let events = std::mem::take(&mut *self.queue.borrow_mut());
        for event in events {
            callback(event, &mut ());
        }
        Ok(PostAction::Continue)
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

/// Errors related to libseat sessions
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Failed to open session
    #[error("Failed to open session")]
    FailedToOpenSession(#[source] io::Error),

    /// Session is already closed,
    #[error("Session is already closed")]
    SessionLost,

    /// A request to the seat daemon failed
    #[error("Seat request failed")]
    Seat(#[source] io::Error),
}
