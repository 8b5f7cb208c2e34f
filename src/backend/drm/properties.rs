//! Typed lookup tables over kernel object properties
//!
//! The kernel identifies properties by numeric ids that differ between devices and even between
//! objects of the same device. A [`PropertyTable`] resolves the properties this crate knows about
//! by name once per fetch and stores them densely, indexed by one of the [`PropertyName`] enums.
//! Properties the kernel does not expose simply have no slot, which is how callers detect missing
//! features (no `zpos`, no `FB_DAMAGE_CLIPS`, no content protection, ...).

use std::{fmt, marker::PhantomData};

use drm::control::property;
use tracing::{debug, trace};

use super::{
    kms::{KmsDevice, ObjectHandle, PropertyKind, RawProperty},
    Error,
};

/// A kernel property this crate knows by name
pub trait PropertyName: Copy + Eq + fmt::Debug + 'static {
    /// Every known property of the object class, in index order
    const ALL: &'static [Self];

    /// Name as exposed by the kernel
    fn name(self) -> &'static str;

    /// Position of the property in [`Self::ALL`]
    fn index(self) -> usize;

    /// Names of the enum values we care about, for enumerated properties
    fn enum_names(self) -> &'static [&'static str] {
        &[]
    }
}

/// Properties of planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneProperty {
    /// Plane type
    Type = 0,
    /// Source rectangle x (16.16 fixed point)
    SrcX,
    /// Source rectangle y (16.16 fixed point)
    SrcY,
    /// Source rectangle width (16.16 fixed point)
    SrcW,
    /// Source rectangle height (16.16 fixed point)
    SrcH,
    /// Destination x on the CRTC
    CrtcX,
    /// Destination y on the CRTC
    CrtcY,
    /// Destination width on the CRTC
    CrtcW,
    /// Destination height on the CRTC
    CrtcH,
    /// Framebuffer
    FbId,
    /// CRTC the plane is routed to
    CrtcId,
    /// Blob of supported format/modifier pairs
    InFormats,
    /// Fence to wait on before scanning out
    InFenceFd,
    /// Damage hints for the framebuffer
    FbDamageClips,
    /// Stacking order
    Zpos,
}

impl PlaneProperty {
    /// Enum index of `Overlay` in [`PlaneProperty::Type`]
    pub const TYPE_OVERLAY: usize = 0;
    /// Enum index of `Primary` in [`PlaneProperty::Type`]
    pub const TYPE_PRIMARY: usize = 1;
    /// Enum index of `Cursor` in [`PlaneProperty::Type`]
    pub const TYPE_CURSOR: usize = 2;
}

impl PropertyName for PlaneProperty {
    const ALL: &'static [Self] = &[
        PlaneProperty::Type,
        PlaneProperty::SrcX,
        PlaneProperty::SrcY,
        PlaneProperty::SrcW,
        PlaneProperty::SrcH,
        PlaneProperty::CrtcX,
        PlaneProperty::CrtcY,
        PlaneProperty::CrtcW,
        PlaneProperty::CrtcH,
        PlaneProperty::FbId,
        PlaneProperty::CrtcId,
        PlaneProperty::InFormats,
        PlaneProperty::InFenceFd,
        PlaneProperty::FbDamageClips,
        PlaneProperty::Zpos,
    ];

    fn name(self) -> &'static str {
        match self {
            PlaneProperty::Type => "type",
            PlaneProperty::SrcX => "SRC_X",
            PlaneProperty::SrcY => "SRC_Y",
            PlaneProperty::SrcW => "SRC_W",
            PlaneProperty::SrcH => "SRC_H",
            PlaneProperty::CrtcX => "CRTC_X",
            PlaneProperty::CrtcY => "CRTC_Y",
            PlaneProperty::CrtcW => "CRTC_W",
            PlaneProperty::CrtcH => "CRTC_H",
            PlaneProperty::FbId => "FB_ID",
            PlaneProperty::CrtcId => "CRTC_ID",
            PlaneProperty::InFormats => "IN_FORMATS",
            PlaneProperty::InFenceFd => "IN_FENCE_FD",
            PlaneProperty::FbDamageClips => "FB_DAMAGE_CLIPS",
            PlaneProperty::Zpos => "zpos",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn enum_names(self) -> &'static [&'static str] {
        match self {
            PlaneProperty::Type => &["Overlay", "Primary", "Cursor"],
            _ => &[],
        }
    }
}

/// Properties of CRTCs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrtcProperty {
    /// Blob id of the programmed mode
    ModeId = 0,
    /// Whether the CRTC is powered
    Active,
}

impl PropertyName for CrtcProperty {
    const ALL: &'static [Self] = &[CrtcProperty::ModeId, CrtcProperty::Active];

    fn name(self) -> &'static str {
        match self {
            CrtcProperty::ModeId => "MODE_ID",
            CrtcProperty::Active => "ACTIVE",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Properties of connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorProperty {
    /// Blob holding the monitor's EDID
    Edid = 0,
    /// Legacy power state
    Dpms,
    /// CRTC driving the connector
    CrtcId,
    /// The connector should not be used as a desktop output
    NonDesktop,
    /// HDCP state
    ContentProtection,
    /// Requested HDCP type
    HdcpContentType,
    /// Mounting orientation of built-in panels
    PanelOrientation,
}

impl ConnectorProperty {
    /// Enum index of `Undesired` in [`ConnectorProperty::ContentProtection`]
    pub const PROTECTION_UNDESIRED: usize = 0;
    /// Enum index of `Desired` in [`ConnectorProperty::ContentProtection`]
    pub const PROTECTION_DESIRED: usize = 1;
    /// Enum index of `Enabled` in [`ConnectorProperty::ContentProtection`]
    pub const PROTECTION_ENABLED: usize = 2;
    /// Enum index of `HDCP Type0` in [`ConnectorProperty::HdcpContentType`]
    pub const HDCP_TYPE_0: usize = 0;
    /// Enum index of `HDCP Type1` in [`ConnectorProperty::HdcpContentType`]
    pub const HDCP_TYPE_1: usize = 1;
    /// Enum index of `On` in [`ConnectorProperty::Dpms`]
    pub const DPMS_ON: usize = 0;
    /// Enum index of `Off` in [`ConnectorProperty::Dpms`]
    pub const DPMS_OFF: usize = 3;
}

impl PropertyName for ConnectorProperty {
    const ALL: &'static [Self] = &[
        ConnectorProperty::Edid,
        ConnectorProperty::Dpms,
        ConnectorProperty::CrtcId,
        ConnectorProperty::NonDesktop,
        ConnectorProperty::ContentProtection,
        ConnectorProperty::HdcpContentType,
        ConnectorProperty::PanelOrientation,
    ];

    fn name(self) -> &'static str {
        match self {
            ConnectorProperty::Edid => "EDID",
            ConnectorProperty::Dpms => "DPMS",
            ConnectorProperty::CrtcId => "CRTC_ID",
            ConnectorProperty::NonDesktop => "non-desktop",
            ConnectorProperty::ContentProtection => "Content Protection",
            ConnectorProperty::HdcpContentType => "HDCP Content Type",
            ConnectorProperty::PanelOrientation => "panel orientation",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn enum_names(self) -> &'static [&'static str] {
        match self {
            ConnectorProperty::Dpms => &["On", "Standby", "Suspend", "Off"],
            ConnectorProperty::ContentProtection => &["Undesired", "Desired", "Enabled"],
            ConnectorProperty::HdcpContentType => &["HDCP Type0", "HDCP Type1"],
            ConnectorProperty::PanelOrientation => {
                &["Normal", "Upside Down", "Left Side Up", "Right Side Up"]
            }
            _ => &[],
        }
    }
}

/// A resolved property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySlot {
    /// Kernel id of the property
    pub handle: property::Handle,
    /// Raw value at fetch time
    pub value: u64,
    /// The property cannot be changed by userspace
    pub immutable: bool,
    /// Legal range for range properties
    pub range: Option<(u64, u64)>,
    /// Raw kernel value of each known enum name, `None` if the kernel lacks that name
    enum_values: Vec<Option<u64>>,
}

/// Dense table of known properties of one kernel object
pub struct PropertyTable<P> {
    slots: Vec<Option<PropertySlot>>,
    _names: PhantomData<P>,
}

impl<P> Clone for PropertyTable<P> {
    fn clone(&self) -> Self {
        PropertyTable {
            slots: self.slots.clone(),
            _names: PhantomData,
        }
    }
}

impl<P: PropertyName> fmt::Debug for PropertyTable<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                P::ALL
                    .iter()
                    .filter_map(|p| self.get(*p).map(|slot| (p.name(), slot.value))),
            )
            .finish()
    }
}

impl<P: PropertyName> Default for PropertyTable<P> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<P: PropertyName> PropertyTable<P> {
    /// A table where every property is absent
    pub fn empty() -> Self {
        PropertyTable {
            slots: vec![None; P::ALL.len()],
            _names: PhantomData,
        }
    }

    /// Builds the table from the kernel's property list of one object
    ///
    /// Properties with unknown names are ignored.
    pub fn from_raw(raw: &[RawProperty]) -> Self {
        let mut table = Self::empty();
        for prop in raw {
            let Some(known) = P::ALL.iter().find(|p| p.name() == prop.name) else {
                continue;
            };

            let (range, kernel_enums) = match &prop.kind {
                PropertyKind::Range(min, max) => (Some((*min, *max)), None),
                PropertyKind::SignedRange(min, max) => (Some((*min as u64, *max as u64)), None),
                PropertyKind::Enum(values) | PropertyKind::Bitmask(values) => (None, Some(values)),
                _ => (None, None),
            };

            let enum_values = known
                .enum_names()
                .iter()
                .map(|name| {
                    let value = kernel_enums
                        .and_then(|values| values.iter().find(|(n, _)| n == name))
                        .map(|(_, v)| *v);
                    if value.is_none() {
                        debug!(property = %prop.name, value = name, "kernel property lacks enum value");
                    }
                    value
                })
                .collect();

            trace!(property = %prop.name, value = prop.value, "resolved property");
            table.slots[known.index()] = Some(PropertySlot {
                handle: prop.handle,
                value: prop.value,
                immutable: prop.immutable,
                range,
                enum_values,
            });
        }
        table
    }

    /// Fetches the properties of `object` from the kernel
    pub fn fetch<D: KmsDevice + ?Sized>(device: &D, object: impl Into<ObjectHandle>) -> Result<Self, Error> {
        Ok(Self::from_raw(&device.properties(object.into())?))
    }

    /// Slot of a property, `None` if the kernel does not expose it
    pub fn get(&self, prop: P) -> Option<&PropertySlot> {
        self.slots.get(prop.index()).and_then(Option::as_ref)
    }

    /// Returns true if the kernel exposes the property
    pub fn has(&self, prop: P) -> bool {
        self.get(prop).is_some()
    }

    /// Kernel id of a property
    pub fn handle(&self, prop: P) -> Option<property::Handle> {
        self.get(prop).map(|slot| slot.handle)
    }

    /// Raw value at fetch time
    pub fn value(&self, prop: P) -> Option<u64> {
        self.get(prop).map(|slot| slot.value)
    }

    /// Legal range of a range property
    pub fn range(&self, prop: P) -> Option<(u64, u64)> {
        self.get(prop).and_then(|slot| slot.range)
    }

    /// Which of the known enum names the current value corresponds to
    ///
    /// Returns `None` if the property is absent or holds a value we do not know.
    pub fn enum_index(&self, prop: P) -> Option<usize> {
        let slot = self.get(prop)?;
        slot.enum_values.iter().position(|v| *v == Some(slot.value))
    }

    /// Raw kernel value of the known enum name at `index`
    pub fn enum_value(&self, prop: P, index: usize) -> Option<u64> {
        self.get(prop)?.enum_values.get(index).copied().flatten()
    }

    /// Finds the known property with the given kernel id
    pub fn find_by_handle(&self, handle: property::Handle) -> Option<P> {
        P::ALL
            .iter()
            .copied()
            .find(|p| self.handle(*p) == Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectorProperty, CrtcProperty, PlaneProperty, PropertyTable};
    use crate::backend::drm::{
        kms::{PropertyKind, RawProperty},
        test_utils::handle,
    };

    fn prop(id: u32, name: &str, value: u64, kind: PropertyKind) -> RawProperty {
        RawProperty {
            handle: handle(id),
            name: name.into(),
            value,
            kind,
            immutable: false,
        }
    }

    #[test]
    fn unknown_properties_are_ignored() {
        let table = PropertyTable::<CrtcProperty>::from_raw(&[
            prop(10, "MODE_ID", 7, PropertyKind::Blob),
            prop(11, "VRR_ENABLED", 0, PropertyKind::Range(0, 1)),
        ]);
        assert_eq!(table.value(CrtcProperty::ModeId), Some(7));
        assert_eq!(table.handle(CrtcProperty::ModeId), Some(handle(10)));
        assert!(!table.has(CrtcProperty::Active));
        assert_eq!(table.find_by_handle(handle(11)), None);
    }

    #[test]
    fn enum_values_map_by_name() {
        // kernel enum values deliberately differ from our indices
        let table = PropertyTable::<PlaneProperty>::from_raw(&[prop(
            1,
            "type",
            2,
            PropertyKind::Enum(vec![
                ("Primary".into(), 1),
                ("Cursor".into(), 2),
                ("Overlay".into(), 0),
            ]),
        )]);
        assert_eq!(table.enum_index(PlaneProperty::Type), Some(PlaneProperty::TYPE_CURSOR));
        assert_eq!(table.enum_value(PlaneProperty::Type, PlaneProperty::TYPE_PRIMARY), Some(1));
    }

    #[test]
    fn missing_enum_names_are_absent() {
        let table = PropertyTable::<ConnectorProperty>::from_raw(&[prop(
            5,
            "Content Protection",
            0,
            PropertyKind::Enum(vec![("Undesired".into(), 0), ("Desired".into(), 1)]),
        )]);
        assert_eq!(
            table.enum_index(ConnectorProperty::ContentProtection),
            Some(ConnectorProperty::PROTECTION_UNDESIRED)
        );
        assert_eq!(
            table.enum_value(ConnectorProperty::ContentProtection, ConnectorProperty::PROTECTION_ENABLED),
            None
        );
        assert_eq!(table.find_by_handle(handle(5)), Some(ConnectorProperty::ContentProtection));
    }

    #[test]
    fn ranges_are_recorded() {
        let table = PropertyTable::<PlaneProperty>::from_raw(&[prop(
            3,
            "zpos",
            1,
            PropertyKind::Range(0, 4),
        )]);
        assert_eq!(table.range(PlaneProperty::Zpos), Some((0, 4)));
        assert_eq!(table.range(PlaneProperty::Type), None);
    }
}
