//! Reexports of crates, that are part of the public api, for convenience

pub use calloop;
#[cfg(feature = "backend_drm")]
pub use drm;
pub use drm_fourcc;
#[cfg(feature = "backend_session_libseat")]
pub use libseat;
pub use rustix;
#[cfg(feature = "backend_udev")]
pub use udev;
