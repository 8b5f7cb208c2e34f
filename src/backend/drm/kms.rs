//! Narrow interface to the kernel mode-setting API
//!
//! Everything in this crate that talks to the kernel does so through [`KmsDevice`]. The trait
//! returns plain data snapshots of the kernel objects, so the allocation and commit logic can be
//! exercised against any implementation. [`DrmDevice`](super::DrmDevice) is the implementation
//! backed by an open DRM node.

use std::{path::PathBuf, time::Duration};

use drm::control::{
    connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags, Mode, RawResourceHandle,
};

use super::Error;

/// Capabilities negotiated with the kernel when the device was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmsCapabilities {
    /// Primary and cursor planes are exposed as planes
    pub universal_planes: bool,
    /// The atomic mode-setting API is in use
    pub atomic: bool,
    /// Page-flip timestamps are on the monotonic clock
    pub monotonic_timestamps: bool,
    /// Preferred size of cursor buffers
    pub cursor_size: (u32, u32),
}

impl Default for KmsCapabilities {
    fn default() -> Self {
        KmsCapabilities {
            universal_planes: false,
            atomic: false,
            monotonic_timestamps: false,
            cursor_size: (64, 64),
        }
    }
}

/// The kernel's resource table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTable {
    /// All CRTCs, in pipe order
    pub crtcs: Vec<crtc::Handle>,
    /// All connectors
    pub connectors: Vec<connector::Handle>,
    /// All encoders
    pub encoders: Vec<encoder::Handle>,
}

impl ResourceTable {
    /// Pipe index of a CRTC, which is its position in the resource table
    pub fn pipe(&self, crtc: crtc::Handle) -> Option<usize> {
        self.crtcs.iter().position(|c| *c == crtc)
    }

    /// A device is only usable for mode-setting if it exposes all three kinds of objects
    pub fn is_kms_capable(&self) -> bool {
        !self.crtcs.is_empty() && !self.connectors.is_empty() && !self.encoders.is_empty()
    }
}

/// Snapshot of a kernel plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Plane handle
    pub handle: plane::Handle,
    /// CRTC the plane is currently routed to
    pub crtc: Option<crtc::Handle>,
    /// Framebuffer currently displayed
    pub fb: Option<framebuffer::Handle>,
    /// Bitmask of pipes the plane can be used with
    pub possible_crtcs: u32,
    /// Supported fourcc codes
    pub formats: Vec<u32>,
}

/// Snapshot of a kernel connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Connector handle
    pub handle: connector::Handle,
    /// Connector type
    pub interface: connector::Interface,
    /// Index of the connector among connectors of the same type
    pub interface_id: u32,
    /// Whether a monitor is plugged in
    pub state: connector::State,
    /// Physical size in millimeters, if known
    pub size_mm: Option<(u32, u32)>,
    /// Encoders able to drive this connector
    pub encoders: Vec<encoder::Handle>,
    /// Encoder currently driving this connector
    pub current_encoder: Option<encoder::Handle>,
    /// Modes advertised by the monitor
    pub modes: Vec<Mode>,
}

/// Snapshot of a kernel encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Encoder handle
    pub handle: encoder::Handle,
    /// CRTC currently feeding the encoder
    pub crtc: Option<crtc::Handle>,
    /// Bitmask of pipes able to feed the encoder
    pub possible_crtcs: u32,
}

/// Snapshot of a kernel CRTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcInfo {
    /// CRTC handle
    pub handle: crtc::Handle,
    /// Mode currently programmed
    pub mode: Option<Mode>,
    /// Framebuffer currently scanned out
    pub fb: Option<framebuffer::Handle>,
    /// Size of the gamma ramp
    pub gamma_length: u32,
}

/// Handle of any object that carries properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectHandle {
    /// A plane
    Plane(plane::Handle),
    /// A CRTC
    Crtc(crtc::Handle),
    /// A connector
    Connector(connector::Handle),
}

impl ObjectHandle {
    /// Raw kernel id of the object
    pub fn raw(&self) -> RawResourceHandle {
        match self {
            ObjectHandle::Plane(h) => (*h).into(),
            ObjectHandle::Crtc(h) => (*h).into(),
            ObjectHandle::Connector(h) => (*h).into(),
        }
    }
}

impl From<plane::Handle> for ObjectHandle {
    fn from(handle: plane::Handle) -> Self {
        ObjectHandle::Plane(handle)
    }
}

impl From<crtc::Handle> for ObjectHandle {
    fn from(handle: crtc::Handle) -> Self {
        ObjectHandle::Crtc(handle)
    }
}

impl From<connector::Handle> for ObjectHandle {
    fn from(handle: connector::Handle) -> Self {
        ObjectHandle::Connector(handle)
    }
}

/// Value domain of a kernel property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// Enumeration of named values
    Enum(Vec<(String, u64)>),
    /// Bitmask of named bits
    Bitmask(Vec<(String, u64)>),
    /// Unsigned range
    Range(u64, u64),
    /// Signed range
    SignedRange(i64, i64),
    /// Blob id
    Blob,
    /// Object id
    Object,
    /// Boolean
    Boolean,
    /// Anything else
    Unknown,
}

/// One property of a kernel object together with its current value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProperty {
    /// Property handle
    pub handle: property::Handle,
    /// Property name as exposed by the kernel
    pub name: String,
    /// Current raw value
    pub value: u64,
    /// Legal values
    pub kind: PropertyKind,
    /// The property cannot be changed by userspace
    pub immutable: bool,
}

/// A rectangle of damage in output coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRect {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width
    pub width: i32,
    /// Height
    pub height: i32,
}

impl DamageRect {
    /// Creates a new damage rectangle
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        DamageRect { x, y, width, height }
    }
}

/// A set of property changes submitted as one atomic commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    entries: Vec<(RawResourceHandle, property::Handle, u64)>,
}

impl AtomicRequest {
    /// Creates an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `prop` of `object` to `value`, overriding earlier values for the same pair
    pub fn add(&mut self, object: impl Into<ObjectHandle>, prop: property::Handle, value: u64) {
        let object = object.into().raw();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(obj, p, _)| *obj == object && *p == prop)
        {
            entry.2 = value;
        } else {
            self.entries.push((object, prop, value));
        }
    }

    /// Value queued for `prop` of `object`
    pub fn value(&self, object: impl Into<ObjectHandle>, prop: property::Handle) -> Option<u64> {
        let object = object.into().raw();
        self.entries
            .iter()
            .find(|(obj, p, _)| *obj == object && *p == prop)
            .map(|(_, _, value)| *value)
    }

    /// All queued changes in insertion order
    pub fn entries(&self) -> &[(RawResourceHandle, property::Handle, u64)] {
        &self.entries
    }

    /// Returns true if nothing was queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues every change of `other` after the changes already queued
    pub fn merge(&mut self, other: AtomicRequest) {
        for (object, prop, value) in other.entries {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|(obj, p, _)| *obj == object && *p == prop)
            {
                entry.2 = value;
            } else {
                self.entries.push((object, prop, value));
            }
        }
    }
}

/// Reply to an immediate vblank query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankReply {
    /// Frame counter of the last vblank
    pub sequence: u32,
    /// Timestamp of the last vblank, `None` if the driver did not provide one
    pub time: Option<Duration>,
}

/// Completion of a page-flip or a non-blocking atomic commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    /// CRTC the commit completed on
    pub crtc: crtc::Handle,
    /// Frame counter at completion
    pub sequence: u32,
    /// Timestamp of the vblank the commit landed on
    pub time: Duration,
}

/// Access to the kernel mode-setting interface of one device
pub trait KmsDevice {
    /// Capabilities negotiated when the device was opened
    fn capabilities(&self) -> KmsCapabilities;

    /// Path of the device node, for diagnostics
    fn device_path(&self) -> Option<PathBuf>;

    /// Reads the resource table
    fn resources(&self) -> Result<ResourceTable, Error>;

    /// Lists all planes exposed to this client
    fn plane_handles(&self) -> Result<Vec<plane::Handle>, Error>;

    /// Reads a plane
    fn plane(&self, handle: plane::Handle) -> Result<PlaneInfo, Error>;

    /// Reads a connector
    fn connector(&self, handle: connector::Handle) -> Result<ConnectorInfo, Error>;

    /// Reads an encoder
    fn encoder(&self, handle: encoder::Handle) -> Result<EncoderInfo, Error>;

    /// Reads a CRTC
    fn crtc(&self, handle: crtc::Handle) -> Result<CrtcInfo, Error>;

    /// Reads all properties of an object with their current values
    fn properties(&self, object: ObjectHandle) -> Result<Vec<RawProperty>, Error>;

    /// Reads the contents of a property blob
    fn property_blob(&self, blob: u64) -> Result<Vec<u8>, Error>;

    /// Uploads a mode as a property blob
    fn create_mode_blob(&self, mode: &Mode) -> Result<u64, Error>;

    /// Uploads damage rectangles as a `FB_DAMAGE_CLIPS` blob
    fn create_damage_blob(&self, rects: &[DamageRect]) -> Result<u64, Error>;

    /// Destroys a property blob
    fn destroy_blob(&self, blob: u64) -> Result<(), Error>;

    /// Submits an atomic commit
    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> Result<(), Error>;

    /// Legacy mode-set, `fb` and `mode` set to `None` disables the CRTC
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> Result<(), Error>;

    /// Legacy page-flip requesting a completion event
    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> Result<(), Error>;

    /// Legacy property update on a connector
    fn set_connector_property(
        &self,
        connector: connector::Handle,
        prop: property::Handle,
        value: u64,
    ) -> Result<(), Error>;

    /// Hides the legacy cursor of a CRTC
    fn disable_cursor(&self, crtc: crtc::Handle) -> Result<(), Error>;

    /// Detaches a plane from its CRTC through the legacy interface
    fn disable_plane(&self, plane: plane::Handle, crtc: crtc::Handle) -> Result<(), Error>;

    /// Uploads a gamma ramp
    fn set_gamma(&self, crtc: crtc::Handle, red: &[u16], green: &[u16], blue: &[u16]) -> Result<(), Error>;

    /// Queries the last vblank of a pipe without waiting
    fn wait_vblank(&self, pipe: usize) -> Result<VblankReply, Error>;

    /// Drains pending completion events
    fn receive_events(&self) -> Result<Vec<PageFlipEvent>, Error>;
}
