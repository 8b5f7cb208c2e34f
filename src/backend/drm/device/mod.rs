//! [`KmsDevice`] implementation backed by an open DRM node

use std::{os::unix::io::AsFd, path::PathBuf, time::Duration};

use drm::control::{
    atomic::AtomicModeReq, connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags,
    Device as ControlDevice, Event, Mode, PageFlipFlags, ResourceHandles,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability, VblankWaitFlags, VblankWaitTarget};
use tracing::{debug, info, info_span, trace};

use super::{
    error::AccessError,
    kms::{
        AtomicRequest, ConnectorInfo, CrtcInfo, DamageRect, EncoderInfo, KmsCapabilities, KmsDevice,
        ObjectHandle, PageFlipEvent, PlaneInfo, PropertyKind, RawProperty, ResourceTable, VblankReply,
    },
    Error,
};
use crate::utils::DevPath;

mod fd;
pub use fd::DrmDeviceFd;

/// An open drm device
///
/// Capabilities are negotiated once when the device is created. Every other call is a thin
/// wrapper around the matching ioctl that converts the kernel objects into plain snapshots.
#[derive(Debug)]
pub struct DrmDevice {
    fd: DrmDeviceFd,
    caps: KmsCapabilities,
    span: tracing::Span,
}

fn access<'a>(fd: &'a DrmDeviceFd, errmsg: &'static str) -> impl FnOnce(std::io::Error) -> Error + 'a {
    move |source| {
        Error::Access(AccessError {
            errmsg,
            dev: fd.dev_path(),
            source,
        })
    }
}

fn crtc_mask(resources: &ResourceHandles, compatible: &[crtc::Handle]) -> u32 {
    resources
        .crtcs()
        .iter()
        .enumerate()
        .filter(|(_, crtc)| compatible.contains(crtc))
        .fold(0, |mask, (pipe, _)| mask | (1 << pipe))
}

impl DrmDevice {
    /// Opens the device and negotiates the client capabilities
    ///
    /// Universal planes are always requested, atomic mode-setting unless `force_legacy` is set.
    pub fn new(fd: DrmDeviceFd, force_legacy: bool) -> Result<Self, Error> {
        let span = info_span!("drm_device", path = ?fd.dev_path());
        let _guard = span.enter();
        info!("DrmDevice initializing");

        let universal_planes = fd
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok();
        let atomic = if force_legacy {
            info!("Atomic mode-setting disabled by configuration");
            false
        } else {
            fd.set_client_capability(ClientCapability::Atomic, true).is_ok()
        };
        if !atomic {
            info!("Falling back to legacy mode-setting");
        }
        let monotonic_timestamps = fd
            .get_driver_capability(DriverCapability::MonotonicTimestamp)
            .unwrap_or(0)
            == 1;
        let cursor_size = (
            fd.get_driver_capability(DriverCapability::CursorWidth).unwrap_or(64) as u32,
            fd.get_driver_capability(DriverCapability::CursorHeight).unwrap_or(64) as u32,
        );
        debug!(
            universal_planes,
            atomic, monotonic_timestamps, ?cursor_size, "Negotiated capabilities"
        );

        drop(_guard);
        Ok(DrmDevice {
            fd,
            caps: KmsCapabilities {
                universal_planes,
                atomic,
                monotonic_timestamps,
                cursor_size,
            },
            span,
        })
    }

    /// Shared file descriptor of the device
    pub fn device_fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    fn resource_handles(&self) -> Result<ResourceHandles, Error> {
        self.fd
            .resource_handles()
            .map_err(access(&self.fd, "Error loading resource handles"))
    }

    fn raw_properties<T: drm::control::ResourceHandle>(&self, handle: T) -> Result<Vec<RawProperty>, Error> {
        let props = self
            .fd
            .get_properties(handle)
            .map_err(access(&self.fd, "Error reading properties"))?;
        let (handles, values) = props.as_props_and_values();
        let mut result = Vec::with_capacity(handles.len());
        for (handle, value) in handles.iter().zip(values.iter()) {
            let info = match self.fd.get_property(*handle) {
                Ok(info) => info,
                Err(err) => {
                    trace!(parent: &self.span, ?handle, "Skipping unreadable property: {}", err);
                    continue;
                }
            };
            let kind = match info.value_type() {
                property::ValueType::Enum(values) => {
                    let (_, enums) = values.values();
                    PropertyKind::Enum(
                        enums
                            .iter()
                            .map(|e| (e.name().to_string_lossy().into_owned(), e.value()))
                            .collect(),
                    )
                }
                property::ValueType::Bitmask => PropertyKind::Bitmask(Vec::new()),
                property::ValueType::UnsignedRange(min, max) => PropertyKind::Range(min, max),
                property::ValueType::SignedRange(min, max) => PropertyKind::SignedRange(min, max),
                property::ValueType::Blob => PropertyKind::Blob,
                property::ValueType::Boolean => PropertyKind::Boolean,
                property::ValueType::Object
                | property::ValueType::CRTC
                | property::ValueType::Connector
                | property::ValueType::Encoder
                | property::ValueType::Framebuffer
                | property::ValueType::Plane
                | property::ValueType::Property => PropertyKind::Object,
                _ => PropertyKind::Unknown,
            };
            result.push(RawProperty {
                handle: *handle,
                name: info.name().to_string_lossy().into_owned(),
                value: *value,
                kind,
                immutable: !info.mutable(),
            });
        }
        Ok(result)
    }
}

impl KmsDevice for DrmDevice {
    fn capabilities(&self) -> KmsCapabilities {
        self.caps
    }

    fn device_path(&self) -> Option<PathBuf> {
        self.fd.dev_path()
    }

    fn resources(&self) -> Result<ResourceTable, Error> {
        let res = self.resource_handles()?;
        Ok(ResourceTable {
            crtcs: res.crtcs().to_vec(),
            connectors: res.connectors().to_vec(),
            encoders: res.encoders().to_vec(),
        })
    }

    fn plane_handles(&self) -> Result<Vec<plane::Handle>, Error> {
        self.fd
            .plane_handles()
            .map_err(access(&self.fd, "Error loading plane handles"))
    }

    fn plane(&self, handle: plane::Handle) -> Result<PlaneInfo, Error> {
        let info = self
            .fd
            .get_plane(handle)
            .map_err(access(&self.fd, "Error loading plane info"))?;
        let res = self.resource_handles()?;
        let compatible = res.filter_crtcs(info.possible_crtcs());
        Ok(PlaneInfo {
            handle,
            crtc: info.crtc(),
            fb: info.framebuffer(),
            possible_crtcs: crtc_mask(&res, &compatible),
            formats: info.formats().to_vec(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> Result<ConnectorInfo, Error> {
        let info = self
            .fd
            .get_connector(handle, true)
            .map_err(access(&self.fd, "Error loading connector info"))?;
        Ok(ConnectorInfo {
            handle,
            interface: info.interface(),
            interface_id: info.interface_id(),
            state: info.state(),
            size_mm: info.size(),
            encoders: info.encoders().to_vec(),
            current_encoder: info.current_encoder(),
            modes: info.modes().to_vec(),
        })
    }

    fn encoder(&self, handle: encoder::Handle) -> Result<EncoderInfo, Error> {
        let info = self
            .fd
            .get_encoder(handle)
            .map_err(access(&self.fd, "Error loading encoder info"))?;
        let res = self.resource_handles()?;
        let compatible = res.filter_crtcs(info.possible_crtcs());
        Ok(EncoderInfo {
            handle,
            crtc: info.crtc(),
            possible_crtcs: crtc_mask(&res, &compatible),
        })
    }

    fn crtc(&self, handle: crtc::Handle) -> Result<CrtcInfo, Error> {
        let info = self
            .fd
            .get_crtc(handle)
            .map_err(access(&self.fd, "Error loading crtc info"))?;
        Ok(CrtcInfo {
            handle,
            mode: info.mode(),
            fb: info.framebuffer(),
            gamma_length: info.gamma_length(),
        })
    }

    fn properties(&self, object: ObjectHandle) -> Result<Vec<RawProperty>, Error> {
        match object {
            ObjectHandle::Plane(handle) => self.raw_properties(handle),
            ObjectHandle::Crtc(handle) => self.raw_properties(handle),
            ObjectHandle::Connector(handle) => self.raw_properties(handle),
        }
    }

    fn property_blob(&self, blob: u64) -> Result<Vec<u8>, Error> {
        self.fd
            .get_property_blob(blob)
            .map_err(access(&self.fd, "Error reading property blob"))
    }

    fn create_mode_blob(&self, mode: &Mode) -> Result<u64, Error> {
        match self
            .fd
            .create_property_blob(mode)
            .map_err(access(&self.fd, "Failed to create property blob for mode"))?
        {
            property::Value::Blob(id) => Ok(id),
            _ => Err(Error::Access(AccessError {
                errmsg: "Kernel returned no blob for mode",
                dev: self.fd.dev_path(),
                source: std::io::Error::from(std::io::ErrorKind::InvalidData),
            })),
        }
    }

    fn create_damage_blob(&self, rects: &[DamageRect]) -> Result<u64, Error> {
        // struct drm_mode_rect { __s32 x1, y1, x2, y2; }
        let mut data = Vec::with_capacity(rects.len() * 16);
        for rect in rects {
            for value in [rect.x, rect.y, rect.x + rect.width, rect.y + rect.height] {
                data.extend_from_slice(&value.to_ne_bytes());
            }
        }
        let blob = drm_ffi::mode::create_property_blob(self.fd.as_fd(), &mut data)
            .map_err(access(&self.fd, "Failed to create damage clips blob"))?;
        Ok(blob.blob_id as u64)
    }

    fn destroy_blob(&self, blob: u64) -> Result<(), Error> {
        self.fd
            .destroy_property_blob(blob)
            .map_err(access(&self.fd, "Failed to destroy property blob"))
    }

    #[profiling::function]
    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> Result<(), Error> {
        let mut req = AtomicModeReq::new();
        for (object, prop, value) in request.entries() {
            req.add_raw_property(*object, *prop, *value);
        }
        trace!(parent: &self.span, ?flags, entries = request.entries().len(), "Atomic commit");
        self.fd
            .atomic_commit(flags, req)
            .map_err(access(&self.fd, "Error committing atomic state"))
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> Result<(), Error> {
        self.fd
            .set_crtc(crtc, fb, (0, 0), connectors, mode)
            .map_err(access(&self.fd, "Error setting crtc"))
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> Result<(), Error> {
        self.fd
            .page_flip(crtc, fb, PageFlipFlags::EVENT, None)
            .map_err(access(&self.fd, "Failed to queue page flip"))
    }

    fn set_connector_property(
        &self,
        connector: connector::Handle,
        prop: property::Handle,
        value: u64,
    ) -> Result<(), Error> {
        self.fd
            .set_property(connector, prop, value)
            .map_err(access(&self.fd, "Failed to set connector property"))
    }

    #[allow(deprecated)]
    fn disable_cursor(&self, crtc: crtc::Handle) -> Result<(), Error> {
        self.fd
            .set_cursor(crtc, Option::<&drm::control::dumbbuffer::DumbBuffer>::None)
            .map_err(access(&self.fd, "Failed to reset cursor"))
    }

    fn disable_plane(&self, plane: plane::Handle, crtc: crtc::Handle) -> Result<(), Error> {
        self.fd
            .set_plane(plane, crtc, None, 0, (0, 0, 0, 0), (0, 0, 0, 0))
            .map_err(access(&self.fd, "Failed to disable plane"))
    }

    fn set_gamma(&self, crtc: crtc::Handle, red: &[u16], green: &[u16], blue: &[u16]) -> Result<(), Error> {
        self.fd
            .set_gamma(crtc, red, green, blue)
            .map_err(access(&self.fd, "Failed to set gamma"))
    }

    fn wait_vblank(&self, pipe: usize) -> Result<VblankReply, Error> {
        let reply = self
            .fd
            .wait_vblank(VblankWaitTarget::Relative(0), VblankWaitFlags::empty(), pipe as u32, 0)
            .map_err(access(&self.fd, "Failed to query vblank"))?;
        Ok(VblankReply {
            sequence: reply.frame(),
            time: reply.time().filter(|time| *time != Duration::ZERO),
        })
    }

    fn receive_events(&self) -> Result<Vec<PageFlipEvent>, Error> {
        let events = self
            .fd
            .receive_events()
            .map_err(access(&self.fd, "Error processing drm events"))?;
        let mut flips = Vec::new();
        for event in events {
            match event {
                Event::PageFlip(event) => {
                    trace!(parent: &self.span, "Got a page-flip event for crtc ({:?})", event.crtc);
                    flips.push(PageFlipEvent {
                        crtc: event.crtc,
                        sequence: event.frame,
                        time: event.duration,
                    });
                }
                _ => trace!(parent: &self.span, "Got a non-page-flip event"),
            }
        }
        Ok(flips)
    }
}

