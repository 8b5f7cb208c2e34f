//! Scripted stand-ins for the kernel, the render path and the watchdog

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    io,
    path::PathBuf,
    rc::Rc,
    time::Duration,
};

use drm::control::{
    connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags, Mode, RawResourceHandle,
};
use drm_fourcc::{DrmFourcc, DrmModifier};

use super::{
    config::DrmBackendConfig,
    error::AccessError,
    kms::{
        AtomicRequest, ConnectorInfo, CrtcInfo, DamageRect, EncoderInfo, KmsCapabilities, KmsDevice,
        ObjectHandle, PageFlipEvent, PlaneInfo, PropertyKind, RawProperty, ResourceTable, VblankReply,
    },
    render::{Framebuffer, FramebufferOrigin, RenderPath},
    watchdog::PageflipWatchdog,
    DrmBackend, Error, OutputId,
};
use crate::backend::backlight::Backlight;

pub(crate) fn handle<T: From<RawResourceHandle>>(id: u32) -> T {
    drm::control::from_u32(id).expect("handles are non-zero")
}

pub(crate) fn prop(id: u32) -> property::Handle {
    handle(id)
}

pub(crate) const PLANE_TYPE: u32 = 1;
pub(crate) const PLANE_FB_ID: u32 = 10;
pub(crate) const PLANE_CRTC_ID: u32 = 11;
pub(crate) const PLANE_IN_FORMATS: u32 = 12;
pub(crate) const PLANE_DAMAGE_CLIPS: u32 = 14;
pub(crate) const PLANE_ZPOS: u32 = 15;
pub(crate) const CRTC_MODE_ID: u32 = 20;
pub(crate) const CRTC_ACTIVE: u32 = 21;
pub(crate) const CONN_EDID: u32 = 30;
pub(crate) const CONN_DPMS: u32 = 31;
pub(crate) const CONN_CRTC_ID: u32 = 32;
pub(crate) const CONN_NON_DESKTOP: u32 = 33;
pub(crate) const CONN_PROTECTION: u32 = 34;
pub(crate) const CONN_HDCP_TYPE: u32 = 35;

const PLANE_RECT_PROPS: [(u32, &str); 8] = [
    (2, "SRC_X"),
    (3, "SRC_Y"),
    (4, "SRC_W"),
    (5, "SRC_H"),
    (6, "CRTC_X"),
    (7, "CRTC_Y"),
    (8, "CRTC_W"),
    (9, "CRTC_H"),
];

/// 1080p-style timings at exactly 60Hz
pub(crate) fn test_mode(width: u16, height: u16) -> Mode {
    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: 148_500,
        hdisplay: width,
        hsync_start: width + 88,
        hsync_end: width + 132,
        htotal: 2200,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 4,
        vsync_end: height + 9,
        vtotal: 1125,
        vscan: 0,
        vrefresh: 60,
        flags: 0,
        type_: 0,
        name: [0; 32],
    })
}

fn access(errno: i32) -> Error {
    Error::Access(AccessError {
        errmsg: "dummy kms",
        dev: None,
        source: io::Error::from_raw_os_error(errno),
    })
}

#[derive(Debug, Clone)]
pub(crate) struct DummyPlane {
    kind: u64,
    possible_crtcs: u32,
    routed_to: Option<usize>,
    zpos: Option<(u64, u64)>,
    in_formats: Option<Vec<u8>>,
    damage_clips: bool,
}

impl DummyPlane {
    fn new(kind: u64, possible_crtcs: u32) -> Self {
        DummyPlane {
            kind,
            possible_crtcs,
            routed_to: None,
            zpos: None,
            in_formats: None,
            damage_clips: false,
        }
    }

    pub(crate) fn overlay(possible_crtcs: u32) -> Self {
        Self::new(0, possible_crtcs)
    }

    pub(crate) fn primary(possible_crtcs: u32) -> Self {
        Self::new(1, possible_crtcs)
    }

    pub(crate) fn cursor(possible_crtcs: u32) -> Self {
        Self::new(2, possible_crtcs)
    }

    pub(crate) fn zpos(mut self, min: u64, max: u64) -> Self {
        self.zpos = Some((min, max));
        self
    }

    pub(crate) fn routed_to(mut self, pipe: usize) -> Self {
        self.routed_to = Some(pipe);
        self
    }

    pub(crate) fn in_formats(mut self, blob: Vec<u8>) -> Self {
        self.in_formats = Some(blob);
        self
    }

    pub(crate) fn damage_clips(mut self) -> Self {
        self.damage_clips = true;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DummyConnector {
    interface: connector::Interface,
    connected: bool,
    possible_crtcs: u32,
    routed_to: Option<usize>,
    modes: Vec<Mode>,
    protection: Option<u64>,
    hdcp_type: Option<u64>,
    edid: Option<Vec<u8>>,
    unreadable: bool,
}

impl DummyConnector {
    fn new(interface: connector::Interface) -> Self {
        DummyConnector {
            interface,
            connected: true,
            possible_crtcs: u32::MAX,
            routed_to: None,
            modes: vec![test_mode(1920, 1080), test_mode(1280, 720)],
            protection: None,
            hdcp_type: None,
            edid: None,
            unreadable: false,
        }
    }

    pub(crate) fn hdmi() -> Self {
        Self::new(connector::Interface::HDMIA)
    }

    pub(crate) fn edp() -> Self {
        Self::new(connector::Interface::EmbeddedDisplayPort)
    }

    pub(crate) fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    pub(crate) fn possible_crtcs(mut self, mask: u32) -> Self {
        self.possible_crtcs = mask;
        self
    }

    pub(crate) fn routed_to(mut self, pipe: usize) -> Self {
        self.routed_to = Some(pipe);
        self
    }

    pub(crate) fn modes(mut self, modes: Vec<Mode>) -> Self {
        self.modes = modes;
        self
    }

    pub(crate) fn content_protection(mut self, value: u64, hdcp_type: Option<u64>) -> Self {
        self.protection = Some(value);
        self.hdcp_type = hdcp_type;
        self
    }

    pub(crate) fn edid(mut self, edid: Vec<u8>) -> Self {
        self.edid = Some(edid);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum KmsCall {
    AtomicCommit {
        flags: AtomicCommitFlags,
        request: AtomicRequest,
    },
    SetCrtc {
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: Vec<connector::Handle>,
        mode: Option<Mode>,
    },
    PageFlip {
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
    },
    SetConnectorProperty {
        connector: connector::Handle,
        prop: property::Handle,
        value: u64,
    },
    DisableCursor(crtc::Handle),
    DisablePlane(plane::Handle),
    SetGamma {
        crtc: crtc::Handle,
        size: usize,
    },
    WaitVblank(usize),
    ModeBlob(u64),
    DamageBlob(u64, Vec<DamageRect>),
    DestroyBlob(u64),
}

impl KmsCall {
    /// Calls that change what is on screen
    pub(crate) fn is_commit(&self) -> bool {
        matches!(
            self,
            KmsCall::AtomicCommit { .. } | KmsCall::SetCrtc { .. } | KmsCall::PageFlip { .. }
        )
    }
}

#[derive(Debug)]
pub(crate) struct DummyKmsBuilder {
    caps: KmsCapabilities,
    crtcs: usize,
    planes: Vec<DummyPlane>,
    connectors: Vec<DummyConnector>,
}

impl DummyKmsBuilder {
    pub(crate) fn crtcs(mut self, count: usize) -> Self {
        self.crtcs = count;
        self
    }

    pub(crate) fn plane(mut self, plane: DummyPlane) -> Self {
        self.planes.push(plane);
        self
    }

    pub(crate) fn connector(mut self, connector: DummyConnector) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Legacy-only device without universal planes
    pub(crate) fn legacy(mut self) -> Self {
        self.caps.atomic = false;
        self.caps.universal_planes = false;
        self
    }

    /// Universal planes exposed, but no atomic API
    pub(crate) fn no_atomic(mut self) -> Self {
        self.caps.atomic = false;
        self
    }

    pub(crate) fn build(self) -> DummyKms {
        let mut blobs = HashMap::new();
        let mut next_blob = 1000;
        let planes = self
            .planes
            .into_iter()
            .enumerate()
            .map(|(i, plane)| {
                let formats_blob = plane.in_formats.clone().map(|data| {
                    next_blob += 1;
                    blobs.insert(next_blob, data);
                    next_blob
                });
                (handle(400 + i as u32), plane, formats_blob)
            })
            .collect();
        let connectors = self
            .connectors
            .into_iter()
            .enumerate()
            .map(|(i, connector)| (i as u32, connector))
            .collect();

        DummyKms {
            caps: self.caps,
            crtcs: (0..self.crtcs as u32).map(|i| handle(100 + i)).collect(),
            planes,
            connectors: RefCell::new(connectors),
            blobs: RefCell::new(blobs),
            next_blob: Cell::new(next_blob),
            calls: RefCell::new(Vec::new()),
            failures: RefCell::new(VecDeque::new()),
            vblank: Cell::new(None),
            events: RefCell::new(Vec::new()),
        }
    }
}

/// An in-memory device that records every request
#[derive(Debug)]
pub(crate) struct DummyKms {
    caps: KmsCapabilities,
    crtcs: Vec<crtc::Handle>,
    planes: Vec<(plane::Handle, DummyPlane, Option<u64>)>,
    connectors: RefCell<Vec<(u32, DummyConnector)>>,
    blobs: RefCell<HashMap<u64, Vec<u8>>>,
    next_blob: Cell<u64>,
    calls: RefCell<Vec<KmsCall>>,
    failures: RefCell<VecDeque<i32>>,
    vblank: Cell<Option<VblankReply>>,
    events: RefCell<Vec<PageFlipEvent>>,
}

impl DummyKms {
    pub(crate) fn builder() -> DummyKmsBuilder {
        DummyKmsBuilder {
            caps: KmsCapabilities {
                universal_planes: true,
                atomic: true,
                monotonic_timestamps: true,
                cursor_size: (64, 64),
            },
            crtcs: 0,
            planes: Vec::new(),
            connectors: Vec::new(),
        }
    }

    /// Two CRTCs with a primary and cursor plane each, one shared overlay
    /// and a connected HDMI head
    pub(crate) fn simple() -> DummyKmsBuilder {
        Self::builder()
            .crtcs(2)
            .plane(DummyPlane::primary(0b01).damage_clips())
            .plane(DummyPlane::primary(0b10).damage_clips())
            .plane(DummyPlane::cursor(0b01))
            .plane(DummyPlane::cursor(0b10))
            .plane(DummyPlane::overlay(0b11))
            .connector(DummyConnector::hdmi())
    }

    pub(crate) fn crtc_handle(&self, pipe: usize) -> crtc::Handle {
        self.crtcs[pipe]
    }

    pub(crate) fn connector_handle(&self, index: u32) -> connector::Handle {
        handle(300 + index)
    }

    pub(crate) fn plane_handle(&self, index: usize) -> plane::Handle {
        self.planes[index].0
    }

    pub(crate) fn calls(&self) -> Vec<KmsCall> {
        self.calls.borrow().clone()
    }

    pub(crate) fn take_calls(&self) -> Vec<KmsCall> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }

    pub(crate) fn commits(&self) -> Vec<KmsCall> {
        self.calls.borrow().iter().filter(|c| c.is_commit()).cloned().collect()
    }

    /// The next commit-type call fails with `errno`
    pub(crate) fn fail_next_commit(&self, errno: i32) {
        self.failures.borrow_mut().push_back(errno);
    }

    pub(crate) fn set_vblank(&self, reply: Option<VblankReply>) {
        self.vblank.set(reply);
    }

    pub(crate) fn complete_flip(&self, pipe: usize, sequence: u32, time: Duration) {
        self.events.borrow_mut().push(PageFlipEvent {
            crtc: self.crtcs[pipe],
            sequence,
            time,
        });
    }

    pub(crate) fn blob_exists(&self, blob: u64) -> bool {
        self.blobs.borrow().contains_key(&blob)
    }

    /// Adds a connector as if it was hot-plugged, returns its index
    pub(crate) fn plug(&self, connector: DummyConnector) -> u32 {
        let mut connectors = self.connectors.borrow_mut();
        let index = connectors.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
        connectors.push((index, connector));
        index
    }

    pub(crate) fn unplug(&self, index: u32) {
        self.connectors.borrow_mut().retain(|(i, _)| *i != index);
    }

    pub(crate) fn set_connected(&self, index: u32, connected: bool) {
        if let Some((_, connector)) = self.connectors.borrow_mut().iter_mut().find(|(i, _)| *i == index) {
            connector.connected = connected;
        }
    }

    /// Reading the connector fails with `EIO` while it stays listed in the resources
    pub(crate) fn set_unreadable(&self, index: u32, unreadable: bool) {
        if let Some((_, connector)) = self.connectors.borrow_mut().iter_mut().find(|(i, _)| *i == index) {
            connector.unreadable = unreadable;
        }
    }

    pub(crate) fn set_protection(&self, index: u32, value: u64) {
        if let Some((_, connector)) = self.connectors.borrow_mut().iter_mut().find(|(i, _)| *i == index) {
            connector.protection = Some(value);
        }
    }

    fn record(&self, call: KmsCall) {
        self.calls.borrow_mut().push(call);
    }

    fn commit_result(&self) -> Result<(), Error> {
        match self.failures.borrow_mut().pop_front() {
            Some(errno) => Err(access(errno)),
            None => Ok(()),
        }
    }

    fn new_blob(&self, data: Vec<u8>) -> u64 {
        let id = self.next_blob.get() + 1;
        self.next_blob.set(id);
        self.blobs.borrow_mut().insert(id, data);
        id
    }

    fn connector_by_raw(&self, raw: u32) -> Option<(u32, DummyConnector)> {
        self.connectors
            .borrow()
            .iter()
            .find(|(i, _)| 300 + i == raw || 200 + i == raw)
            .cloned()
    }

    fn interface_id(&self, index: u32) -> u32 {
        let connectors = self.connectors.borrow();
        let Some((_, this)) = connectors.iter().find(|(i, _)| *i == index) else {
            return 0;
        };
        connectors
            .iter()
            .filter(|(i, c)| *i <= index && c.interface == this.interface)
            .count() as u32
    }
}

fn raw_prop(id: u32, name: &str, value: u64, kind: PropertyKind) -> RawProperty {
    RawProperty {
        handle: prop(id),
        name: name.into(),
        value,
        kind,
        immutable: false,
    }
}

fn named(values: &[&str]) -> PropertyKind {
    PropertyKind::Enum(
        values
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i as u64))
            .collect(),
    )
}

impl KmsDevice for DummyKms {
    fn capabilities(&self) -> KmsCapabilities {
        self.caps
    }

    fn device_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/dev/dri/card0"))
    }

    fn resources(&self) -> Result<ResourceTable, Error> {
        let connectors = self.connectors.borrow();
        Ok(ResourceTable {
            crtcs: self.crtcs.clone(),
            connectors: connectors.iter().map(|(i, _)| handle(300 + i)).collect(),
            encoders: connectors.iter().map(|(i, _)| handle(200 + i)).collect(),
        })
    }

    fn plane_handles(&self) -> Result<Vec<plane::Handle>, Error> {
        Ok(self.planes.iter().map(|(h, _, _)| *h).collect())
    }

    fn plane(&self, handle: plane::Handle) -> Result<PlaneInfo, Error> {
        let (_, plane, _) = self
            .planes
            .iter()
            .find(|(h, _, _)| *h == handle)
            .ok_or_else(|| access(libc::ENOENT))?;
        Ok(PlaneInfo {
            handle,
            crtc: plane.routed_to.map(|pipe| self.crtcs[pipe]),
            fb: plane.routed_to.map(|pipe| self::handle(600 + pipe as u32)),
            possible_crtcs: plane.possible_crtcs,
            formats: vec![DrmFourcc::Xrgb8888 as u32, DrmFourcc::Argb8888 as u32],
        })
    }

    fn connector(&self, handle: connector::Handle) -> Result<ConnectorInfo, Error> {
        let (index, connector) = self
            .connector_by_raw(u32::from(handle))
            .ok_or_else(|| access(libc::ENOENT))?;
        if connector.unreadable {
            return Err(access(libc::EIO));
        }
        Ok(ConnectorInfo {
            handle,
            interface: connector.interface,
            interface_id: self.interface_id(index),
            state: if connector.connected {
                connector::State::Connected
            } else {
                connector::State::Disconnected
            },
            size_mm: Some((600, 340)),
            encoders: vec![self::handle(200 + index)],
            current_encoder: connector.routed_to.map(|_| self::handle(200 + index)),
            modes: if connector.connected {
                connector.modes.clone()
            } else {
                Vec::new()
            },
        })
    }

    fn encoder(&self, handle: encoder::Handle) -> Result<EncoderInfo, Error> {
        let (_, connector) = self
            .connector_by_raw(u32::from(handle))
            .ok_or_else(|| access(libc::ENOENT))?;
        Ok(EncoderInfo {
            handle,
            crtc: connector.routed_to.map(|pipe| self.crtcs[pipe]),
            possible_crtcs: connector.possible_crtcs,
        })
    }

    fn crtc(&self, handle: crtc::Handle) -> Result<CrtcInfo, Error> {
        let pipe = self
            .crtcs
            .iter()
            .position(|c| *c == handle)
            .ok_or_else(|| access(libc::ENOENT))?;
        let routed = self
            .connectors
            .borrow()
            .iter()
            .find(|(_, c)| c.routed_to == Some(pipe))
            .map(|(_, c)| c.clone());
        Ok(CrtcInfo {
            handle,
            mode: routed.as_ref().and_then(|c| c.modes.first().copied()),
            fb: routed.map(|_| self::handle(600 + pipe as u32)),
            gamma_length: 256,
        })
    }

    fn properties(&self, object: ObjectHandle) -> Result<Vec<RawProperty>, Error> {
        match object {
            ObjectHandle::Plane(handle) => {
                let (_, plane, formats_blob) = self
                    .planes
                    .iter()
                    .find(|(h, _, _)| *h == handle)
                    .ok_or_else(|| access(libc::ENOENT))?;
                let mut props = vec![raw_prop(
                    PLANE_TYPE,
                    "type",
                    plane.kind,
                    named(&["Overlay", "Primary", "Cursor"]),
                )];
                for (id, name) in PLANE_RECT_PROPS {
                    props.push(raw_prop(id, name, 0, PropertyKind::Range(0, u32::MAX as u64)));
                }
                props.push(raw_prop(PLANE_FB_ID, "FB_ID", 0, PropertyKind::Object));
                props.push(raw_prop(PLANE_CRTC_ID, "CRTC_ID", 0, PropertyKind::Object));
                if let Some(blob) = formats_blob {
                    props.push(raw_prop(PLANE_IN_FORMATS, "IN_FORMATS", *blob, PropertyKind::Blob));
                }
                if plane.damage_clips {
                    props.push(raw_prop(PLANE_DAMAGE_CLIPS, "FB_DAMAGE_CLIPS", 0, PropertyKind::Blob));
                }
                if let Some((min, max)) = plane.zpos {
                    let mut zpos = raw_prop(PLANE_ZPOS, "zpos", min, PropertyKind::Range(min, max));
                    zpos.immutable = min == max;
                    props.push(zpos);
                }
                Ok(props)
            }
            ObjectHandle::Crtc(_) => Ok(vec![
                raw_prop(CRTC_MODE_ID, "MODE_ID", 0, PropertyKind::Blob),
                raw_prop(CRTC_ACTIVE, "ACTIVE", 0, PropertyKind::Range(0, 1)),
            ]),
            ObjectHandle::Connector(handle) => {
                let (_, connector) = self
                    .connector_by_raw(u32::from(handle))
                    .ok_or_else(|| access(libc::ENOENT))?;
                let edid = match &connector.edid {
                    Some(data) => self.new_blob(data.clone()),
                    None => 0,
                };
                let mut props = vec![
                    raw_prop(CONN_EDID, "EDID", edid, PropertyKind::Blob),
                    raw_prop(CONN_DPMS, "DPMS", 0, named(&["On", "Standby", "Suspend", "Off"])),
                    raw_prop(CONN_CRTC_ID, "CRTC_ID", 0, PropertyKind::Object),
                    raw_prop(CONN_NON_DESKTOP, "non-desktop", 0, PropertyKind::Range(0, 1)),
                ];
                if let Some(value) = connector.protection {
                    props.push(raw_prop(
                        CONN_PROTECTION,
                        "Content Protection",
                        value,
                        named(&["Undesired", "Desired", "Enabled"]),
                    ));
                }
                if let Some(value) = connector.hdcp_type {
                    props.push(raw_prop(
                        CONN_HDCP_TYPE,
                        "HDCP Content Type",
                        value,
                        named(&["HDCP Type0", "HDCP Type1"]),
                    ));
                }
                Ok(props)
            }
        }
    }

    fn property_blob(&self, blob: u64) -> Result<Vec<u8>, Error> {
        self.blobs
            .borrow()
            .get(&blob)
            .cloned()
            .ok_or_else(|| access(libc::ENOENT))
    }

    fn create_mode_blob(&self, _mode: &Mode) -> Result<u64, Error> {
        let id = self.new_blob(Vec::new());
        self.record(KmsCall::ModeBlob(id));
        Ok(id)
    }

    fn create_damage_blob(&self, rects: &[DamageRect]) -> Result<u64, Error> {
        let id = self.new_blob(Vec::new());
        self.record(KmsCall::DamageBlob(id, rects.to_vec()));
        Ok(id)
    }

    fn destroy_blob(&self, blob: u64) -> Result<(), Error> {
        self.record(KmsCall::DestroyBlob(blob));
        self.blobs
            .borrow_mut()
            .remove(&blob)
            .map(|_| ())
            .ok_or_else(|| access(libc::ENOENT))
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> Result<(), Error> {
        self.record(KmsCall::AtomicCommit {
            flags,
            request: request.clone(),
        });
        self.commit_result()
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> Result<(), Error> {
        self.record(KmsCall::SetCrtc {
            crtc,
            fb,
            connectors: connectors.to_vec(),
            mode,
        });
        self.commit_result()
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> Result<(), Error> {
        self.record(KmsCall::PageFlip { crtc, fb });
        self.commit_result()
    }

    fn set_connector_property(
        &self,
        connector: connector::Handle,
        prop: property::Handle,
        value: u64,
    ) -> Result<(), Error> {
        self.record(KmsCall::SetConnectorProperty { connector, prop, value });
        Ok(())
    }

    fn disable_cursor(&self, crtc: crtc::Handle) -> Result<(), Error> {
        self.record(KmsCall::DisableCursor(crtc));
        Ok(())
    }

    fn disable_plane(&self, plane: plane::Handle, _crtc: crtc::Handle) -> Result<(), Error> {
        self.record(KmsCall::DisablePlane(plane));
        Ok(())
    }

    fn set_gamma(&self, crtc: crtc::Handle, red: &[u16], _green: &[u16], _blue: &[u16]) -> Result<(), Error> {
        self.record(KmsCall::SetGamma { crtc, size: red.len() });
        Ok(())
    }

    fn wait_vblank(&self, pipe: usize) -> Result<VblankReply, Error> {
        self.record(KmsCall::WaitVblank(pipe));
        self.vblank.get().ok_or_else(|| access(libc::EINVAL))
    }

    fn receive_events(&self) -> Result<Vec<PageFlipEvent>, Error> {
        Ok(std::mem::take(&mut *self.events.borrow_mut()))
    }
}

#[derive(Debug, Default)]
pub(crate) struct DummyRenderer {
    pub(crate) outputs: HashMap<OutputId, ((u16, u16), DrmFourcc)>,
    pub(crate) frames: Vec<(OutputId, Vec<DamageRect>)>,
    pub(crate) fail_init: bool,
    pub(crate) fail_render: bool,
    pub(crate) stride: Option<u32>,
    next_fb: u32,
}

impl RenderPath for DummyRenderer {
    type Error = io::Error;

    fn init_output(&mut self, output: OutputId, size: (u16, u16), format: DrmFourcc) -> Result<(), Self::Error> {
        if self.fail_init {
            return Err(io::Error::new(io::ErrorKind::Other, "renderer refused output"));
        }
        self.outputs.insert(output, (size, format));
        Ok(())
    }

    fn fini_output(&mut self, output: OutputId) {
        self.outputs.remove(&output);
    }

    fn render(&mut self, output: OutputId, damage: &[DamageRect]) -> Result<Framebuffer, Self::Error> {
        if self.fail_render {
            return Err(io::Error::new(io::ErrorKind::Other, "render failed"));
        }
        let ((w, h), format) = *self
            .outputs
            .get(&output)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.frames.push((output, damage.to_vec()));
        self.next_fb += 1;
        Ok(Framebuffer {
            handle: handle(500 + self.next_fb),
            size: (w as u32, h as u32),
            format,
            modifier: DrmModifier::Linear,
            stride: self.stride.unwrap_or(w as u32 * 4),
            origin: FramebufferOrigin::Renderer,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogCall {
    Arm(OutputId, Duration),
    Disarm(OutputId),
}

#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingWatchdog {
    log: Rc<RefCell<Vec<WatchdogCall>>>,
}

impl RecordingWatchdog {
    pub(crate) fn calls(&self) -> Vec<WatchdogCall> {
        self.log.borrow().clone()
    }

    pub(crate) fn is_armed(&self, output: OutputId) -> bool {
        self.log
            .borrow()
            .iter()
            .rev()
            .find_map(|call| match call {
                WatchdogCall::Arm(o, _) if *o == output => Some(true),
                WatchdogCall::Disarm(o) if *o == output => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }
}

impl PageflipWatchdog for RecordingWatchdog {
    fn arm(&mut self, output: OutputId, _name: &str, timeout: Duration) {
        self.log.borrow_mut().push(WatchdogCall::Arm(output, timeout));
    }

    fn disarm(&mut self, output: OutputId) {
        self.log.borrow_mut().push(WatchdogCall::Disarm(output));
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DummyBacklight {
    pub(crate) value: Rc<Cell<u32>>,
    pub(crate) max: u32,
}

impl Backlight for DummyBacklight {
    fn brightness(&self) -> io::Result<u32> {
        Ok(self.value.get())
    }

    fn max_brightness(&self) -> io::Result<u32> {
        Ok(self.max)
    }

    fn set_brightness(&mut self, value: u32) -> io::Result<()> {
        self.value.set(value);
        Ok(())
    }
}

pub(crate) type TestBackend = DrmBackend<DummyKms, DummyRenderer>;

pub(crate) fn test_config() -> DrmBackendConfig {
    DrmBackendConfig {
        pageflip_timeout: Some(Duration::from_secs(1)),
        ..DrmBackendConfig::default()
    }
}

/// A backend over `device` with a recording watchdog installed
pub(crate) fn backend(device: DummyKms) -> (TestBackend, RecordingWatchdog) {
    backend_with_config(device, test_config())
}

pub(crate) fn backend_with_config(device: DummyKms, config: DrmBackendConfig) -> (TestBackend, RecordingWatchdog) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let watchdog = RecordingWatchdog::default();
    let mut backend = DrmBackend::new(device, DummyRenderer::default(), config).expect("backend bootstrap");
    backend.set_watchdog(watchdog.clone());
    (backend, watchdog)
}
