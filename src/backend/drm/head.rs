//! Heads, the connectors of a device and the monitors plugged into them

use drm::control::{connector, crtc, Mode};
use tracing::{debug, trace};

use super::{
    crtc::HeadRouting,
    kms::{ConnectorInfo, KmsDevice},
    properties::{ConnectorProperty, PropertyTable},
    Error, OutputId,
};
use crate::backend::backlight::Backlight;

/// Maximum number of heads one output can drive as clones
pub const MAX_CLONED_CONNECTORS: usize = 4;

/// Content protection status of a head, or desired protection of an output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HdcpProtection {
    /// No protection
    #[default]
    Disabled,
    /// HDCP type 0
    Type0,
    /// HDCP type 1
    Type1,
}

impl HdcpProtection {
    /// Reads the protection status from a connector's properties
    ///
    /// A connector without `HDCP Content Type` only knows type 0. A protection that is desired
    /// but not yet enabled by the kernel reads as disabled.
    pub fn from_props(props: &PropertyTable<ConnectorProperty>) -> Self {
        let Some(protection) = props.enum_index(ConnectorProperty::ContentProtection) else {
            return HdcpProtection::Disabled;
        };
        let content_type = if props.has(ConnectorProperty::HdcpContentType) {
            match props.enum_index(ConnectorProperty::HdcpContentType) {
                Some(content_type) => content_type,
                None => return HdcpProtection::Disabled,
            }
        } else {
            ConnectorProperty::HDCP_TYPE_0
        };

        match (protection, content_type) {
            (ConnectorProperty::PROTECTION_ENABLED, ConnectorProperty::HDCP_TYPE_0) => HdcpProtection::Type0,
            (ConnectorProperty::PROTECTION_ENABLED, ConnectorProperty::HDCP_TYPE_1) => HdcpProtection::Type1,
            _ => HdcpProtection::Disabled,
        }
    }

    /// Enum indices of `Content Protection` and `HDCP Content Type` requesting this protection
    pub(crate) fn as_request(self) -> (usize, usize) {
        match self {
            HdcpProtection::Disabled => (
                ConnectorProperty::PROTECTION_UNDESIRED,
                ConnectorProperty::HDCP_TYPE_0,
            ),
            HdcpProtection::Type0 => (
                ConnectorProperty::PROTECTION_DESIRED,
                ConnectorProperty::HDCP_TYPE_0,
            ),
            HdcpProtection::Type1 => (
                ConnectorProperty::PROTECTION_DESIRED,
                ConnectorProperty::HDCP_TYPE_1,
            ),
        }
    }
}

/// Description of the monitor attached to a head
///
/// The backend does not parse EDID itself. Without outside help make and model stay
/// `"unknown"`, see [`DrmBackend::head_edid`](super::DrmBackend::head_edid).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    /// Manufacturer
    pub make: String,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial: Option<String>,
    /// Physical size in millimeters
    pub size_mm: Option<(u32, u32)>,
}

impl Default for MonitorInfo {
    fn default() -> Self {
        MonitorInfo {
            make: String::from("unknown"),
            model: String::from("unknown"),
            serial: None,
            size_mm: None,
        }
    }
}

/// Formats the name of a connector like `HDMI-A-1`
pub fn connector_name(interface: connector::Interface, interface_id: u32) -> String {
    match interface {
        connector::Interface::Unknown => String::from("UNNAMED"),
        interface => format!("{}-{}", interface.as_str(), interface_id),
    }
}

/// A connector of the device
#[derive(Debug)]
pub struct Head {
    connector: connector::Handle,
    name: String,
    connected: bool,
    internal: bool,
    non_desktop: bool,
    monitor: MonitorInfo,
    possible_crtcs: u32,
    inherited_crtc: Option<crtc::Handle>,
    inherited_mode: Option<Mode>,
    modes: Vec<Mode>,
    props: PropertyTable<ConnectorProperty>,
    protection: HdcpProtection,
    backlight: Option<Box<dyn Backlight>>,
    pub(crate) output: Option<OutputId>,
}

impl Head {
    /// Reads a freshly discovered connector, including the routing the kernel booted with
    pub(crate) fn create<D: KmsDevice + ?Sized>(
        device: &D,
        connector: connector::Handle,
    ) -> Result<Head, Error> {
        let info = device.connector(connector)?;
        let name = connector_name(info.interface, info.interface_id);
        let internal = matches!(
            info.interface,
            connector::Interface::LVDS | connector::Interface::EmbeddedDisplayPort
        );

        let mut head = Head {
            connector,
            name,
            connected: false,
            internal,
            non_desktop: false,
            monitor: MonitorInfo::default(),
            possible_crtcs: 0,
            inherited_crtc: None,
            inherited_mode: None,
            modes: Vec::new(),
            props: PropertyTable::empty(),
            protection: HdcpProtection::Disabled,
            backlight: None,
            output: None,
        };
        let current_encoder = info.current_encoder;
        head.update_info(device, info)?;
        head.read_current_setup(device, current_encoder)?;
        debug!(head = %head.name, connected = head.connected, inherited_crtc = ?head.inherited_crtc, "Created head");
        Ok(head)
    }

    /// Refreshes everything derived from the connector and its properties
    ///
    /// Returns true if anything a compositor would care about changed.
    pub(crate) fn update_info<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        info: ConnectorInfo,
    ) -> Result<bool, Error> {
        let props = PropertyTable::fetch(device, self.connector)?;

        let mut possible_crtcs = 0;
        for encoder in &info.encoders {
            possible_crtcs |= device.encoder(*encoder)?.possible_crtcs;
        }
        trace!(head = %self.name, possible_crtcs, "Read connector");

        let connected = info.state == connector::State::Connected;
        let non_desktop = props.value(ConnectorProperty::NonDesktop).unwrap_or(0) != 0;
        let changed = connected != self.connected || info.modes != self.modes || non_desktop != self.non_desktop;

        self.connected = connected;
        self.non_desktop = non_desktop;
        self.modes = info.modes;
        self.possible_crtcs = possible_crtcs;
        self.monitor.size_mm = info.size_mm;
        self.protection = HdcpProtection::from_props(&props);
        self.props = props;
        Ok(changed)
    }

    /// Re-reads only the connector's properties
    ///
    /// Returns the property that `prop` refers to, if it is one we track.
    pub(crate) fn update_props<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        prop: drm::control::property::Handle,
    ) -> Result<Option<ConnectorProperty>, Error> {
        let Some(known) = self.props.find_by_handle(prop) else {
            return Ok(None);
        };
        self.props = PropertyTable::fetch(device, self.connector)?;
        if known == ConnectorProperty::ContentProtection {
            self.protection = HdcpProtection::from_props(&self.props);
        }
        Ok(Some(known))
    }

    fn read_current_setup<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        current_encoder: Option<drm::control::encoder::Handle>,
    ) -> Result<(), Error> {
        let Some(encoder) = current_encoder else {
            return Ok(());
        };
        self.inherited_crtc = device.encoder(encoder)?.crtc;
        if let Some(crtc) = self.inherited_crtc {
            self.inherited_mode = device.crtc(crtc)?.mode;
        }
        Ok(())
    }

    /// Connector handle
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Name like `HDMI-A-1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a monitor is plugged in
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Built-in panel (LVDS or eDP)
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// The kernel marks the head as not meant for desktop use (e.g. VR headsets)
    pub fn is_non_desktop(&self) -> bool {
        self.non_desktop
    }

    /// Monitor description
    pub fn monitor(&self) -> &MonitorInfo {
        &self.monitor
    }

    /// Replaces the monitor description, e.g. with data from an EDID parser
    pub fn set_monitor(&mut self, monitor: MonitorInfo) {
        self.monitor = monitor;
    }

    /// Union of the possible-CRTC masks of the head's encoders
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    /// CRTC driving the head when it was discovered
    pub fn inherited_crtc(&self) -> Option<crtc::Handle> {
        self.inherited_crtc
    }

    /// Mode programmed when the head was discovered
    pub fn inherited_mode(&self) -> Option<Mode> {
        self.inherited_mode
    }

    /// Modes advertised by the monitor
    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    /// Kernel properties of the connector
    pub fn props(&self) -> &PropertyTable<ConnectorProperty> {
        &self.props
    }

    /// Content protection currently in effect
    pub fn protection(&self) -> HdcpProtection {
        self.protection
    }

    pub(crate) fn set_protection(&mut self, protection: HdcpProtection) {
        self.protection = protection;
    }

    /// Output this head is attached to
    pub fn output(&self) -> Option<OutputId> {
        self.output
    }

    /// Backlight of the panel, if any
    pub fn backlight(&self) -> Option<&dyn Backlight> {
        self.backlight.as_deref()
    }

    pub(crate) fn backlight_mut(&mut self) -> Option<&mut (dyn Backlight + 'static)> {
        self.backlight.as_deref_mut()
    }

    pub(crate) fn set_backlight(&mut self, backlight: Option<Box<dyn Backlight>>) {
        self.backlight = backlight;
    }

    /// What the CRTC allocator needs to know about this head
    pub fn routing(&self) -> HeadRouting {
        HeadRouting {
            possible_crtcs: self.possible_crtcs,
            inherited_crtc: self.inherited_crtc,
        }
    }
}
