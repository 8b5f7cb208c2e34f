//! The seam between the backend and whatever produces pixels
//!
//! The backend does not render by itself. Once per repaint it asks a [`RenderPath`] for a
//! [`Framebuffer`] covering the whole output and scans that out on the output's primary plane.

use std::fmt;

use drm::control::framebuffer;
use drm_fourcc::{DrmFourcc, DrmModifier};

use super::{kms::DamageRect, OutputId};

/// Who produced the contents of a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramebufferOrigin {
    /// Rendered by the compositor's render path
    Renderer,
    /// A client buffer imported for direct scanout
    Client,
}

/// A buffer registered with the kernel for scanout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    /// Kernel handle
    pub handle: framebuffer::Handle,
    /// Size in pixels
    pub size: (u32, u32),
    /// Pixel format
    pub format: DrmFourcc,
    /// Layout modifier
    pub modifier: DrmModifier,
    /// Bytes per row of the first plane
    pub stride: u32,
    /// Producer of the contents
    pub origin: FramebufferOrigin,
}

impl Framebuffer {
    /// Returns true if scanning out `other` instead needs a full legacy mode-set
    pub fn needs_modeset_for(&self, other: &Framebuffer) -> bool {
        self.stride != other.stride
    }
}

/// Producer of output contents
pub trait RenderPath {
    /// Error type returned by the render path
    type Error: std::error::Error + Send + Sync + 'static;

    /// Prepares rendering for an output that is about to be enabled
    fn init_output(&mut self, output: OutputId, size: (u16, u16), format: DrmFourcc) -> Result<(), Self::Error>;

    /// Releases everything held for an output
    fn fini_output(&mut self, output: OutputId);

    /// Renders the next frame of an output
    ///
    /// `damage` is the region that changed since the last frame, in output coordinates.
    fn render(&mut self, output: OutputId, damage: &[DamageRect]) -> Result<Framebuffer, Self::Error>;
}

impl<R: RenderPath + ?Sized> RenderPath for Box<R> {
    type Error = R::Error;

    fn init_output(&mut self, output: OutputId, size: (u16, u16), format: DrmFourcc) -> Result<(), Self::Error> {
        (**self).init_output(output, size, format)
    }

    fn fini_output(&mut self, output: OutputId) {
        (**self).fini_output(output)
    }

    fn render(&mut self, output: OutputId, damage: &[DamageRect]) -> Result<Framebuffer, Self::Error> {
        (**self).render(output, damage)
    }
}

bitflags::bitflags! {
    /// How a frame was presented
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PresentationFlags: u32 {
        /// Presentation was synchronized to the vertical retrace
        const VSYNC = 0x1;
        /// The timestamp comes from a hardware clock
        const HW_CLOCK = 0x2;
        /// Completion was signaled by the hardware
        const HW_COMPLETION = 0x4;
        /// A client buffer was scanned out directly
        const ZERO_COPY = 0x8;
        /// The frame was not presented, the timestamp is a guess
        const INVALID = 0x10;
    }
}

impl fmt::Display for FramebufferOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramebufferOrigin::Renderer => f.write_str("renderer"),
            FramebufferOrigin::Client => f.write_str("client"),
        }
    }
}
