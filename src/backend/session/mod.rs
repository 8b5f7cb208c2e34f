//!
//! Abstraction of different session apis.
//!
//! Sessions provide a way for multiple graphical systems to run in parallel by providing
//! mechanisms to switch between and handle device access and permissions for every running
//! instance.
//!
//! They are crucial to allow unprivileged processes to use graphical devices. A compositor
//! reacts to [`Event::PauseSession`] by calling
//! [`DrmBackend::session_paused`](crate::backend::drm::DrmBackend::session_paused) and to
//! [`Event::ActivateSession`] by calling
//! [`DrmBackend::session_activated`](crate::backend::drm::DrmBackend::session_activated).
//!
//! The following mechanisms are currently provided:
//!     - libseat - through seatd or logind
//!
use std::{cell::RefCell, os::unix::io::OwnedFd, path::Path, rc::Rc};

use rustix::fs::OFlags;

/// General session interface.
///
/// Provides a way to open and close devices and change the active vt.
pub trait Session {
    /// Error type of the implementation
    type Error: std::error::Error;

    /// Opens a device at the given `path` with the given flags.
    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error>;
    /// Close a previously opened file descriptor
    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error>;

    /// Change the currently active virtual terminal
    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error>;

    /// Check if this session is currently active
    fn is_active(&self) -> bool;
    /// Which seat this session is on
    fn seat(&self) -> String;
}

/// Events the session delivers to the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The session was paused, devices must not be used until it is activated again
    PauseSession,
    /// The session became active again
    ActivateSession,
}

impl<S: Session> Session for Rc<RefCell<S>> {
    type Error = S::Error;

    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error> {
        self.borrow_mut().open(path, flags)
    }

    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error> {
        self.borrow_mut().close(fd)
    }

    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error> {
        self.borrow_mut().change_vt(vt)
    }

    fn is_active(&self) -> bool {
        self.borrow().is_active()
    }

    fn seat(&self) -> String {
        self.borrow().seat()
    }
}

#[cfg(feature = "backend_session_libseat")]
pub mod libseat;
