//! Drm/Kms output pipeline
//!
//! This module drives the kernel mode-setting API on behalf of a compositor. It owns the
//! hardware objects of one device and hands them out to the outputs the compositor creates.
//!
//! ## Objects
//!
//! - A *head* ([`Head`]) is a connector. Heads appear and vanish with hotplug events.
//! - An *output* ([`DrmOutput`]) is what the compositor renders to. It drives one or more heads
//!   (clones) through a single CRTC and owns a primary plane and optionally a cursor plane.
//! - The [`PlaneManager`] tracks which kernel plane is used by which output, the CRTC pool does
//!   the same for CRTCs.
//!
//! ## Repaint cycle
//!
//! The compositor drives repaints through the [`DrmBackend`]:
//!
//! 1. [`DrmBackend::repaint_begin`] opens a [`PendingState`],
//! 2. [`DrmBackend::repaint_output`] renders every output that needs it,
//! 3. [`DrmBackend::repaint_flush`] submits all of them, as one atomic commit if possible,
//! 4. the kernel signals completion on the device fd, [`DrmNotifier`] wakes the event loop and
//!    [`DrmBackend::dispatch_kms_events`] turns the completions into
//!    [`BackendEvent::FrameFinished`].
//!
//! [`DrmBackend::start_repaint_loop`] (re)starts the cycle for an idle output.
//!
//! ## Talking to the kernel
//!
//! All kernel access goes through the [`KmsDevice`] trait. [`DrmDevice`] implements it on top of
//! an open drm node, tests use an in-memory implementation.
//!
//! Atomic mode-setting is used whenever the driver supports it, legacy mode-setting otherwise.
//! Setting `SCANOUT_USE_LEGACY` forces the legacy path, see [`DrmBackendConfig::from_env`].

mod backend;
mod commit;
pub mod config;
pub mod crtc;
mod device;
pub mod dumb;
mod error;
pub mod head;
pub mod hotplug;
pub mod kms;
pub mod output;
pub mod plane;
pub mod properties;
pub mod render;
mod repaint;
mod source;
pub mod state;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod test_utils;

pub use self::backend::{BackendEvent, DrmBackend};
pub use self::config::{ConfigError, DrmBackendConfig};
pub use self::device::{DrmDevice, DrmDeviceFd};
pub use self::dumb::DumbRenderPath;
pub use self::error::{AccessError, Error};
pub use self::head::{HdcpProtection, Head};
pub use self::hotplug::{Uevent, UeventKind};
pub use self::kms::{DamageRect, KmsCapabilities, KmsDevice};
pub use self::output::{DisableOutcome, DrmOutput, OutputId, PendingIntent, RepaintStatus};
pub use self::plane::{PlaneId, PlaneManager, PlaneType};
pub use self::render::{Framebuffer, FramebufferOrigin, PresentationFlags, RenderPath};
pub use self::source::DrmNotifier;
pub use self::state::{DestRect, DpmsLevel, PendingState, SourceRect};
pub use self::watchdog::{CalloopWatchdog, NoWatchdog, PageflipWatchdog};
