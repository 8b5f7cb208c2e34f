#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like CRTC
#![allow(clippy::upper_case_acronyms)]

//! # scanout: the output half of a DRM/KMS compositor
//!
//! This crate drives the kernel display subsystem on behalf of a wayland compositor. It owns the
//! hardware resources (CRTCs, planes, connectors) shared between several physical outputs, turns
//! each repaint cycle into one atomic or legacy kernel commit and reacts to the asynchronous
//! completion of those commits.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the pipeline itself: property tables, the plane and CRTC
//!   allocators, heads, the per-output state machine and the transactional commit logic.
//! - [`backend::udev`] finds the primary GPU and delivers hotplug notifications.
//! - [`backend::session`] abstracts over the launcher that owns the privileged device.
//! - [`backend::backlight`] exposes the backlight of internal panels.
//!
//! Rendering, input and window management are not part of this crate. Frames are produced by a
//! [`RenderPath`](backend::drm::RenderPath) supplied by the compositor, and the compositor decides
//! *when* to repaint by reacting to [`BackendEvent`](backend::drm::BackendEvent)s.
//!
//! ## The event loop and state handling
//!
//! Like the rest of its ecosystem, this crate is built around [`calloop`]. Nothing here spawns
//! threads: page-flip completions, hotplug events, session changes and the pageflip watchdog are
//! all delivered as event sources on the compositor's loop.
//!
//! ## Logging
//!
//! All internal logging goes through [`tracing`]. To limit the log level at compile time add a
//! dependency on [`tracing`] to your binary crate and enable the matching features:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod utils;

pub mod reexports;
