//! Backend helpers for driving display hardware
//!
//! - [`drm`] turns repaint cycles into kernel mode-setting commits.
//! - [`udev`] discovers DRM devices and watches them for hotplug events.
//! - [`session`] abstracts over the launcher holding the privileged device access.
//! - [`backlight`] controls the backlight of internal panels.

#[cfg(feature = "backend_drm")]
pub mod drm;

pub mod backlight;

#[cfg(feature = "backend_session")]
pub mod session;

#[cfg(feature = "backend_udev")]
pub mod udev;
