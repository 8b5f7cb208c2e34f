//! Software render path painting outputs with dumb buffers
//!
//! Every output gets two dumb buffers used in turn, so the buffer being painted is never the
//! one being scanned out. The contents are a solid color, which is enough to light up a monitor
//! and to exercise the whole commit pipeline without a GPU renderer.

use std::{collections::HashMap, io};

use drm::{
    buffer::Buffer,
    control::{dumbbuffer::DumbBuffer, framebuffer, Device as ControlDevice},
};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, trace, warn};

use super::{
    kms::DamageRect,
    render::{Framebuffer, FramebufferOrigin, RenderPath},
    DrmDeviceFd, OutputId,
};

/// Errors of the dumb-buffer render path
#[derive(Debug, thiserror::Error)]
pub enum DumbError {
    /// The format cannot be painted by this render path
    #[error("Format {0} is not supported by the dumb render path")]
    UnsupportedFormat(DrmFourcc),
    /// The output was never initialized
    #[error("Output {0:?} has no dumb buffers")]
    UnknownOutput(OutputId),
    /// A kernel request failed
    #[error("{0}")]
    Access(&'static str, #[source] io::Error),
}

/// Bits per pixel and color depth of the formats we can paint
fn bpp_and_depth(format: DrmFourcc) -> Option<(u32, u32)> {
    match format {
        DrmFourcc::Xrgb8888 => Some((32, 24)),
        DrmFourcc::Argb8888 => Some((32, 32)),
        DrmFourcc::Rgb565 => Some((16, 16)),
        DrmFourcc::Xrgb2101010 => Some((32, 30)),
        _ => None,
    }
}

/// Encodes a `0xRRGGBB` color as the little-endian bytes of one pixel
fn pack_pixel(format: DrmFourcc, rgb: u32) -> Vec<u8> {
    let (r, g, b) = ((rgb >> 16) & 0xff, (rgb >> 8) & 0xff, rgb & 0xff);
    match format {
        DrmFourcc::Rgb565 => {
            let pixel = ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3);
            (pixel as u16).to_le_bytes().to_vec()
        }
        DrmFourcc::Xrgb2101010 => {
            let pixel = (0b11 << 30) | (r << 22) | (g << 12) | (b << 2);
            pixel.to_le_bytes().to_vec()
        }
        _ => (0xff00_0000 | rgb).to_le_bytes().to_vec(),
    }
}

#[derive(Debug)]
struct DumbSlot {
    buffer: DumbBuffer,
    fb: framebuffer::Handle,
}

#[derive(Debug)]
struct DumbOutput {
    slots: Vec<DumbSlot>,
    next: usize,
    format: DrmFourcc,
    color: u32,
}

/// [`RenderPath`] painting solid colors into dumb buffers
#[derive(Debug)]
pub struct DumbRenderPath {
    fd: DrmDeviceFd,
    outputs: HashMap<OutputId, DumbOutput>,
    color: u32,
}

impl DumbRenderPath {
    /// Creates a render path allocating from the given device
    pub fn new(fd: DrmDeviceFd) -> Self {
        DumbRenderPath {
            fd,
            outputs: HashMap::new(),
            color: 0x33_4455,
        }
    }

    /// Sets the `0xRRGGBB` color of an output, or of outputs initialized later if `None`
    pub fn set_color(&mut self, output: Option<OutputId>, rgb: u32) {
        match output.and_then(|id| self.outputs.get_mut(&id)) {
            Some(state) => state.color = rgb,
            None => self.color = rgb,
        }
    }

    fn destroy(&self, output: OutputId, state: DumbOutput) {
        for slot in state.slots {
            if let Err(err) = self.fd.destroy_framebuffer(slot.fb) {
                warn!(?output, fb = ?slot.fb, "Failed to destroy framebuffer: {}", err);
            }
            if let Err(err) = self.fd.destroy_dumb_buffer(slot.buffer) {
                warn!(?output, "Failed to destroy dumb buffer: {}", err);
            }
        }
    }
}

impl RenderPath for DumbRenderPath {
    type Error = DumbError;

    fn init_output(&mut self, output: OutputId, size: (u16, u16), format: DrmFourcc) -> Result<(), DumbError> {
        let (bpp, depth) = bpp_and_depth(format).ok_or(DumbError::UnsupportedFormat(format))?;
        if let Some(old) = self.outputs.remove(&output) {
            self.destroy(output, old);
        }

        let mut state = DumbOutput {
            slots: Vec::with_capacity(2),
            next: 0,
            format,
            color: self.color,
        };
        for _ in 0..2 {
            let buffer = match self
                .fd
                .create_dumb_buffer((size.0 as u32, size.1 as u32), format, bpp)
            {
                Ok(buffer) => buffer,
                Err(err) => {
                    self.destroy(output, state);
                    return Err(DumbError::Access("Failed to create dumb buffer", err));
                }
            };
            let fb = match self.fd.add_framebuffer(&buffer, depth, bpp) {
                Ok(fb) => fb,
                Err(err) => {
                    let _ = self.fd.destroy_dumb_buffer(buffer);
                    self.destroy(output, state);
                    return Err(DumbError::Access("Failed to add framebuffer", err));
                }
            };
            state.slots.push(DumbSlot { buffer, fb });
        }
        debug!(?output, ?size, %format, "Created dumb buffers");
        self.outputs.insert(output, state);
        Ok(())
    }

    fn fini_output(&mut self, output: OutputId) {
        if let Some(state) = self.outputs.remove(&output) {
            self.destroy(output, state);
        }
    }

    fn render(&mut self, output: OutputId, damage: &[DamageRect]) -> Result<Framebuffer, DumbError> {
        let state = self
            .outputs
            .get_mut(&output)
            .ok_or(DumbError::UnknownOutput(output))?;
        let index = state.next;
        state.next = (state.next + 1) % state.slots.len().max(1);
        let pixel = pack_pixel(state.format, state.color);
        let format = state.format;
        let slot = state
            .slots
            .get_mut(index)
            .ok_or(DumbError::UnknownOutput(output))?;
        trace!(?output, fb = ?slot.fb, damage = damage.len(), "Painting dumb buffer");

        let (width, height) = slot.buffer.size();
        let stride = slot.buffer.pitch();
        {
            let mut mapping = self
                .fd
                .map_dumb_buffer(&mut slot.buffer)
                .map_err(|err| DumbError::Access("Failed to map dumb buffer", err))?;
            for chunk in mapping.chunks_exact_mut(pixel.len()) {
                chunk.copy_from_slice(&pixel);
            }
        }

        Ok(Framebuffer {
            handle: slot.fb,
            size: (width, height),
            format,
            modifier: DrmModifier::Linear,
            stride,
            origin: FramebufferOrigin::Renderer,
        })
    }
}

impl Drop for DumbRenderPath {
    fn drop(&mut self) {
        let outputs: Vec<_> = self.outputs.drain().collect();
        for (output, state) in outputs {
            self.destroy(output, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use drm_fourcc::DrmFourcc;

    use super::{bpp_and_depth, pack_pixel};

    #[test]
    fn packs_pixels_per_format() {
        assert_eq!(pack_pixel(DrmFourcc::Xrgb8888, 0x11_2233), vec![0x33, 0x22, 0x11, 0xff]);
        assert_eq!(pack_pixel(DrmFourcc::Rgb565, 0xff_ffff), vec![0xff, 0xff]);
        assert_eq!(pack_pixel(DrmFourcc::Rgb565, 0xff_0000), 0xf800u16.to_le_bytes().to_vec());
        assert_eq!(
            pack_pixel(DrmFourcc::Xrgb2101010, 0xff_ffff),
            0xffcf_f3fcu32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn knows_depth_of_supported_formats() {
        assert_eq!(bpp_and_depth(DrmFourcc::Xrgb8888), Some((32, 24)));
        assert_eq!(bpp_and_depth(DrmFourcc::Rgb565), Some((16, 16)));
        assert_eq!(bpp_and_depth(DrmFourcc::Nv12), None);
    }
}
