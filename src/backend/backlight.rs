//! Backlight control of internal panels
//!
//! Heads of internal panels (LVDS, eDP) can carry a [`Backlight`]. The backend only reads and
//! writes raw brightness values, scaling them to and from the `0..=255` range it exposes.

use std::{fmt, io};

/// A backlight device
pub trait Backlight: fmt::Debug {
    /// Current brightness in device units
    fn brightness(&self) -> io::Result<u32>;
    /// Maximum brightness in device units
    fn max_brightness(&self) -> io::Result<u32>;
    /// Sets the brightness in device units
    fn set_brightness(&mut self, value: u32) -> io::Result<()>;
}

#[cfg(feature = "backend_udev")]
pub use self::udev_backlight::UdevBacklight;

#[cfg(feature = "backend_udev")]
mod udev_backlight {
    use std::{io, path::Path};

    use tracing::{debug, trace};
    use udev::{Device, Enumerator};

    use super::Backlight;

    /// Kind of a sysfs backlight, in order of preference
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum BacklightKind {
        Firmware,
        Platform,
        Raw,
    }

    impl BacklightKind {
        fn from_attribute(value: &str) -> Option<Self> {
            match value.trim() {
                "firmware" => Some(BacklightKind::Firmware),
                "platform" => Some(BacklightKind::Platform),
                "raw" => Some(BacklightKind::Raw),
                _ => None,
            }
        }
    }

    /// Backlight exposed in `/sys/class/backlight`
    pub struct UdevBacklight {
        device: Device,
    }

    impl std::fmt::Debug for UdevBacklight {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("UdevBacklight")
                .field("syspath", &self.device.syspath())
                .finish()
        }
    }

    fn read_attribute(device: &Device, name: &str) -> io::Result<u32> {
        device
            .attribute_value(name)
            .and_then(|value| value.to_str())
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unreadable attribute `{}`", name)))
    }

    impl UdevBacklight {
        /// Finds the backlight of the panel driven by the card at `card_syspath`
        ///
        /// Firmware backlights are preferred over platform ones, raw backlights are only used
        /// if they belong to the card itself.
        pub fn find(card_syspath: &Path) -> io::Result<Option<UdevBacklight>> {
            let card_parent = Device::from_syspath(card_syspath)?
                .parent()
                .map(|parent| parent.syspath().to_path_buf());

            let mut enumerator = Enumerator::new()?;
            enumerator.match_subsystem("backlight")?;

            let mut best: Option<(BacklightKind, Device)> = None;
            for device in enumerator.scan_devices()? {
                let Some(kind) = device
                    .attribute_value("type")
                    .and_then(|value| value.to_str())
                    .and_then(BacklightKind::from_attribute)
                else {
                    continue;
                };
                if kind == BacklightKind::Raw {
                    let parent = device.parent().map(|p| p.syspath().to_path_buf());
                    let belongs_to_card = match (parent, &card_parent) {
                        (Some(parent), Some(card)) => parent.starts_with(card),
                        _ => false,
                    };
                    if !belongs_to_card {
                        trace!(syspath = ?device.syspath(), "Skipping raw backlight of another device");
                        continue;
                    }
                }
                if best.as_ref().map_or(true, |(best_kind, _)| kind < *best_kind) {
                    best = Some((kind, device));
                }
            }

            Ok(best.map(|(kind, device)| {
                debug!(syspath = ?device.syspath(), ?kind, "Found backlight");
                UdevBacklight { device }
            }))
        }
    }

    impl Backlight for UdevBacklight {
        fn brightness(&self) -> io::Result<u32> {
            read_attribute(&self.device, "actual_brightness").or_else(|_| read_attribute(&self.device, "brightness"))
        }

        fn max_brightness(&self) -> io::Result<u32> {
            read_attribute(&self.device, "max_brightness")
        }

        fn set_brightness(&mut self, value: u32) -> io::Result<()> {
            self.device.set_attribute_value("brightness", value.to_string())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::BacklightKind;

        #[test]
        fn prefers_firmware_backlights() {
            let firmware = BacklightKind::from_attribute("firmware\n").unwrap();
            let platform = BacklightKind::from_attribute("platform").unwrap();
            let raw = BacklightKind::from_attribute("raw").unwrap();
            assert!(firmware < platform && platform < raw);
            assert_eq!(BacklightKind::from_attribute("other"), None);
        }
    }
}
