//! Reaction to connector hotplug and property-change uevents
//!
//! The kernel announces both kinds of changes through a `change` uevent on the card device. A
//! plain hotplug event means the connector list or the state of any connector may have changed
//! and the whole table is re-read. An event carrying `CONNECTOR` and `PROPERTY` names the one
//! property that changed, which is then refreshed without touching the rest of the connector.

use drm::control::{connector, property};
use tracing::{debug, info, trace, warn};

use super::{
    head::Head,
    kms::KmsDevice,
    properties::{ConnectorProperty, CrtcProperty, PropertyTable},
    render::RenderPath,
    BackendEvent, DrmBackend, Error,
};

/// The parts of a uevent relevant to mode-setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Uevent {
    /// Kernel number of the card, `N` of `cardN`
    pub sysnum: Option<u32>,
    /// `HOTPLUG=1` was set
    pub hotplug: bool,
    /// `CONNECTOR` id, for single-property notifications
    pub connector: Option<u32>,
    /// `PROPERTY` id, for single-property notifications
    pub property: Option<u32>,
}

/// What a [`Uevent`] asks the backend to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventKind {
    /// Another device, or not a hotplug event
    Unrelated,
    /// Re-read the whole connector table
    Hotplug,
    /// Re-read one property of one connector
    ConnectorProperty {
        /// Connector that changed
        connector: connector::Handle,
        /// Property that changed
        property: property::Handle,
    },
}

impl Uevent {
    /// Extracts the relevant properties of a udev device
    #[cfg(feature = "backend_udev")]
    pub fn from_udev(device: &udev::Device) -> Uevent {
        let number = |name: &str| {
            device
                .property_value(name)
                .and_then(|value| value.to_str())
                .and_then(|value| value.parse::<u32>().ok())
        };
        Uevent {
            sysnum: device.sysnum().map(|n| n as u32),
            hotplug: number("HOTPLUG") == Some(1),
            connector: number("CONNECTOR"),
            property: number("PROPERTY"),
        }
    }

    /// Classifies the event for the card with the given sysnum
    ///
    /// A backend that does not know its sysnum accepts events from any card.
    pub fn classify(&self, card_sysnum: Option<u32>) -> UeventKind {
        if let (Some(card), Some(sysnum)) = (card_sysnum, self.sysnum) {
            if card != sysnum {
                return UeventKind::Unrelated;
            }
        }
        if !self.hotplug {
            return UeventKind::Unrelated;
        }

        let connector = self.connector.and_then(drm::control::from_u32::<connector::Handle>);
        let property = self.property.and_then(drm::control::from_u32::<property::Handle>);
        match (connector, property) {
            (Some(connector), Some(property)) => UeventKind::ConnectorProperty { connector, property },
            _ => UeventKind::Hotplug,
        }
    }
}

impl<D: KmsDevice, R: RenderPath> DrmBackend<D, R> {
    /// Handles a uevent of the card
    pub fn handle_uevent(&mut self, event: &Uevent) -> Result<(), Error> {
        match event.classify(self.sysnum) {
            UeventKind::Unrelated => {
                trace!(parent: &self.span, ?event, "Ignoring uevent");
                Ok(())
            }
            UeventKind::Hotplug => {
                debug!(parent: &self.span, "Hotplug event");
                self.update_heads()
            }
            UeventKind::ConnectorProperty { connector, property } => {
                debug!(parent: &self.span, ?connector, ?property, "Connector property changed");
                self.update_conn_props(connector, property)
            }
        }
    }

    /// Refreshes one tracked property of a connector
    ///
    /// Unknown connectors are ignored, they may have vanished before the event was read. The
    /// same holds for a known connector the kernel already dropped, the hotplug event that
    /// follows removes its head.
    pub fn update_conn_props(&mut self, connector: connector::Handle, prop: property::Handle) -> Result<(), Error> {
        let Some(head) = self.heads.iter_mut().find(|h| h.connector() == connector) else {
            trace!(parent: &self.span, ?connector, "Property change for unknown connector");
            return Ok(());
        };

        let before = head.protection();
        let updated = head.update_props(&self.device, prop);
        let protection = head.protection();
        let name = head.name().to_owned();

        match updated {
            Ok(Some(ConnectorProperty::ContentProtection)) if protection != before => {
                info!(parent: &self.span, head = %name, ?protection, "Content protection changed");
                self.events
                    .push(BackendEvent::ContentProtectionChanged { connector, protection });
            }
            Ok(_) => {}
            Err(err) => debug!(parent: &self.span, head = %name, "Unable to read connector properties: {}", err),
        }
        Ok(())
    }

    /// Re-reads the connector table and reconciles the heads with it
    ///
    /// New connectors become heads, vanished connectors are detached and destroyed. An enabled
    /// output that loses its last head is disabled. A connector that cannot be read is skipped,
    /// the others are still reconciled.
    pub fn update_heads(&mut self) -> Result<(), Error> {
        let resources = self.device.resources()?;
        let mut changed = false;

        for connector in &resources.connectors {
            match self.heads.iter_mut().find(|h| h.connector() == *connector) {
                Some(head) => {
                    let updated = self
                        .device
                        .connector(*connector)
                        .and_then(|info| head.update_info(&self.device, info));
                    let name = head.name().to_owned();
                    let connected = head.is_connected();
                    match updated {
                        Ok(true) => {
                            debug!(parent: &self.span, head = %name, connected, "Head changed");
                            changed = true;
                        }
                        Ok(false) => {}
                        Err(err) => warn!(parent: &self.span, head = %name, "Failed to update head: {}", err),
                    }
                }
                None => match Head::create(&self.device, *connector) {
                    Ok(head) => {
                        info!(parent: &self.span, head = %head.name(), "Head created");
                        self.heads.push(head);
                        changed = true;
                    }
                    Err(err) => warn!(parent: &self.span, ?connector, "Failed to create head: {}", err),
                },
            }
        }

        let vanished: Vec<connector::Handle> = self
            .heads
            .iter()
            .map(Head::connector)
            .filter(|c| !resources.connectors.contains(c))
            .collect();
        for connector in vanished {
            self.destroy_head(connector)?;
            changed = true;
        }

        for crtc in &resources.crtcs {
            if !self.crtc_props.contains_key(crtc) {
                let props = PropertyTable::<CrtcProperty>::fetch(&self.device, *crtc)?;
                self.crtc_props.insert(*crtc, props);
            }
        }
        self.crtc_props.retain(|crtc, _| resources.crtcs.contains(crtc));
        let in_use: Vec<_> = self.outputs.values().filter_map(|o| o.crtc()).collect();
        self.crtcs.reconcile(&resources.crtcs, &in_use);
        self.resources = resources;

        if changed {
            self.events.push(BackendEvent::HeadsChanged);
        }
        Ok(())
    }

    fn destroy_head(&mut self, connector: connector::Handle) -> Result<(), Error> {
        let output = self.head(connector).and_then(Head::output);
        self.detach_head(connector)?;
        if let Some(id) = output {
            let orphaned = self
                .outputs
                .get(&id)
                .map_or(false, |o| o.is_enabled() && o.heads().is_empty());
            if orphaned {
                info!(parent: &self.span, ?id, "Output lost its last head, disabling");
                self.disable_output(id)?;
            }
        }
        if let Some(head) = self.heads.iter().find(|h| h.connector() == connector) {
            info!(parent: &self.span, head = %head.name(), "Head destroyed");
        }
        self.heads.retain(|h| h.connector() != connector);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Uevent, UeventKind};
    use crate::backend::drm::{
        head::HdcpProtection,
        test_utils::{backend, handle, prop, DummyConnector, DummyKms, CONN_PROTECTION},
        BackendEvent, DisableOutcome,
    };

    fn hotplug(sysnum: u32) -> Uevent {
        Uevent {
            sysnum: Some(sysnum),
            hotplug: true,
            connector: None,
            property: None,
        }
    }

    #[test]
    fn classifies_uevents() {
        assert_eq!(hotplug(0).classify(Some(0)), UeventKind::Hotplug);
        assert_eq!(hotplug(1).classify(Some(0)), UeventKind::Unrelated);
        assert_eq!(hotplug(1).classify(None), UeventKind::Hotplug);

        let not_hotplug = Uevent {
            hotplug: false,
            ..hotplug(0)
        };
        assert_eq!(not_hotplug.classify(Some(0)), UeventKind::Unrelated);

        let property = Uevent {
            connector: Some(300),
            property: Some(34),
            ..hotplug(0)
        };
        assert_eq!(
            property.classify(Some(0)),
            UeventKind::ConnectorProperty {
                connector: handle(300),
                property: prop(34),
            }
        );

        let connector_only = Uevent {
            connector: Some(300),
            ..hotplug(0)
        };
        assert_eq!(connector_only.classify(Some(0)), UeventKind::Hotplug);
    }

    #[test]
    fn hotplug_adds_and_removes_heads() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        assert_eq!(backend.heads().len(), 1);
        backend.take_events();

        let index = backend.device().plug(DummyConnector::edp());
        backend.handle_uevent(&hotplug(0)).unwrap();
        assert_eq!(backend.heads().len(), 2);
        assert!(backend.head(backend.device().connector_handle(index)).is_some());
        assert_eq!(backend.take_events(), vec![BackendEvent::HeadsChanged]);

        backend.device().unplug(index);
        backend.handle_uevent(&hotplug(0)).unwrap();
        assert_eq!(backend.heads().len(), 1);
        assert_eq!(backend.take_events(), vec![BackendEvent::HeadsChanged]);
    }

    #[test]
    fn unchanged_table_is_quiet() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        backend.take_events();
        backend.handle_uevent(&hotplug(0)).unwrap();
        assert!(backend.take_events().is_empty());
    }

    #[test]
    fn disconnect_is_reported() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        backend.take_events();
        backend.device().set_connected(0, false);
        backend.handle_uevent(&hotplug(0)).unwrap();
        assert!(!backend.heads()[0].is_connected());
        assert_eq!(backend.take_events(), vec![BackendEvent::HeadsChanged]);
    }

    #[test]
    fn losing_the_last_head_disables_the_output() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        let connector = backend.device().connector_handle(0);
        let id = backend.create_output_for_head(connector).unwrap();
        backend.enable_output(id).unwrap();
        assert!(backend.output(id).unwrap().is_enabled());

        backend.device().unplug(0);
        backend.handle_uevent(&hotplug(0)).unwrap();
        assert!(backend.heads().is_empty());
        let output = backend.output(id).unwrap();
        assert!(!output.is_enabled());
        assert!(output.heads().is_empty());
        assert_eq!(backend.disable_output(id).unwrap(), DisableOutcome::Done);
    }

    #[test]
    fn protection_change_is_refreshed() {
        let device = DummyKms::builder()
            .crtcs(1)
            .plane(crate::backend::drm::test_utils::DummyPlane::primary(0b1))
            .connector(DummyConnector::hdmi().content_protection(1, Some(1)))
            .build();
        let (mut backend, _) = backend(device);
        let connector = backend.device().connector_handle(0);
        assert_eq!(backend.head(connector).unwrap().protection(), HdcpProtection::Disabled);
        backend.take_events();

        backend.device().set_protection(0, 2);
        let event = Uevent {
            connector: Some(300),
            property: Some(CONN_PROTECTION),
            ..hotplug(0)
        };
        backend.handle_uevent(&event).unwrap();
        assert_eq!(backend.head(connector).unwrap().protection(), HdcpProtection::Type1);
        assert_eq!(
            backend.take_events(),
            vec![BackendEvent::ContentProtectionChanged {
                connector,
                protection: HdcpProtection::Type1,
            }]
        );
    }

    #[test]
    fn property_change_for_vanished_connector_is_ignored() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        backend.take_events();
        let event = Uevent {
            connector: Some(399),
            property: Some(CONN_PROTECTION),
            ..hotplug(0)
        };
        backend.handle_uevent(&event).unwrap();
        assert!(backend.take_events().is_empty());
    }

    #[test]
    fn property_change_racing_an_unplug_is_ignored() {
        let device = DummyKms::builder()
            .crtcs(1)
            .plane(crate::backend::drm::test_utils::DummyPlane::primary(0b1))
            .connector(DummyConnector::hdmi().content_protection(1, Some(1)))
            .build();
        let (mut backend, _) = backend(device);
        let connector = backend.device().connector_handle(0);
        backend.take_events();

        backend.device().unplug(0);
        let event = Uevent {
            connector: Some(300),
            property: Some(CONN_PROTECTION),
            ..hotplug(0)
        };
        backend.handle_uevent(&event).unwrap();
        assert!(backend.head(connector).is_some());
        assert!(backend.take_events().is_empty());

        backend.handle_uevent(&hotplug(0)).unwrap();
        assert!(backend.head(connector).is_none());
        assert_eq!(backend.take_events(), vec![BackendEvent::HeadsChanged]);
    }

    #[test]
    fn unreadable_connector_does_not_stop_reconciliation() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        let index = backend.device().plug(DummyConnector::edp());
        backend.handle_uevent(&hotplug(0)).unwrap();
        assert_eq!(backend.heads().len(), 2);
        backend.take_events();

        backend.device().set_unreadable(0, true);
        backend.device().unplug(index);
        backend.handle_uevent(&hotplug(0)).unwrap();

        assert_eq!(backend.heads().len(), 1);
        assert!(backend.head(backend.device().connector_handle(0)).is_some());
        assert!(backend.head(backend.device().connector_handle(index)).is_none());
        assert_eq!(backend.take_events(), vec![BackendEvent::HeadsChanged]);
    }
}
