//! `udev` related functionality for automated device scanning
//!
//! This module mainly provides the [`UdevBackend`], which monitors the DRM devices of a seat and
//! yields [`UdevEvent`]s as they are added, changed or removed. It plugs into a calloop event
//! loop as an [`EventSource`].
//!
//! Additionally this contains [`primary_gpu`] and [`all_gpus`] to select the device a
//! compositor should drive.

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt, io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd},
    path::{Path, PathBuf},
};

use calloop::{
    generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory,
};
use libc::dev_t;
use tracing::{debug, info, info_span, trace, warn};
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

use crate::backend::drm::Uevent;

struct MonitorFd(MonitorSocket);

impl AsFd for MonitorFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the socket lives as long as the returned borrow
        unsafe { BorrowedFd::borrow_raw(self.0.as_raw_fd()) }
    }
}

/// Backend to monitor available drm devices.
///
/// Provides a way to automatically scan for available gpus and notifies the
/// event loop of any changes. Can be used to provide hot-plug functionality for gpus and
/// attached monitors.
pub struct UdevBackend {
    devices: HashMap<dev_t, PathBuf>,
    monitor: Generic<MonitorFd>,
    span: tracing::Span,
}

impl fmt::Debug for UdevBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdevBackend")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl UdevBackend {
    /// Creates a new [`UdevBackend`] for the devices of `seat`
    pub fn new<S: AsRef<str>>(seat: S) -> io::Result<UdevBackend> {
        let seat = seat.as_ref();
        let span = info_span!("backend_udev", seat = seat);
        let _guard = span.enter();

        let devices = all_gpus(seat)?
            .into_iter()
            .flat_map(|path| match rustix::fs::stat(&path) {
                Ok(stat) => Some((stat.st_rdev as dev_t, path)),
                Err(err) => {
                    warn!("Unable to get id of {:?}, Error: {:?}. Skipping", path, err);
                    None
                }
            })
            .collect();

        let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
        debug!("Successfully initialized");

        drop(_guard);
        Ok(UdevBackend {
            devices,
            monitor: Generic::new(MonitorFd(monitor), Interest::READ, Mode::Level),
            span,
        })
    }

    /// Devices known to the backend, as `(device id, device node)` pairs
    pub fn device_list(&self) -> impl Iterator<Item = (dev_t, &Path)> {
        self.devices.iter().map(|(id, path)| (*id, path.as_ref()))
    }
}

/// Events generated by the [`UdevBackend`]
#[derive(Debug)]
pub enum UdevEvent {
    /// A new device has been detected
    Added {
        /// ID of the new device
        device_id: dev_t,
        /// Path of the new device
        path: PathBuf,
    },
    /// A device has changed, usually connectors were plugged or a connector property changed
    Changed {
        /// ID of the changed device
        device_id: dev_t,
        /// The parsed uevent, to be handed to
        /// [`DrmBackend::handle_uevent`](crate::backend::drm::DrmBackend::handle_uevent)
        event: Uevent,
    },
    /// A device has been removed
    Removed {
        /// ID of the removed device
        device_id: dev_t,
    },
}

impl EventSource for UdevBackend {
    type Event = UdevEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let mut readable = false;
        self.monitor.process_events(readiness, token, |_, _| {
            readable = true;
            Ok(PostAction::Continue)
        })?;
        if !readable {
            return Ok(PostAction::Continue);
        }

        let _guard = self.span.enter();
        for event in self.monitor.get_ref().0.iter() {
            trace!("Udev event: type={:?}, devnum={:?}", event.event_type(), event.devnum());
            match event.event_type() {
                EventType::Add => {
                    if let (Some(path), Some(devnum)) = (event.devnode(), event.devnum()) {
                        info!("New device: #{} at {}", devnum, path.display());
                        if self.devices.insert(devnum, path.to_path_buf()).is_none() {
                            callback(
                                UdevEvent::Added {
                                    device_id: devnum,
                                    path: path.to_path_buf(),
                                },
                                &mut (),
                            );
                        }
                    }
                }
                EventType::Remove => {
                    if let Some(devnum) = event.devnum() {
                        info!("Device removed: #{}", devnum);
                        if self.devices.remove(&devnum).is_some() {
                            callback(UdevEvent::Removed { device_id: devnum }, &mut ());
                        }
                    }
                }
                EventType::Change => {
                    if let Some(devnum) = event.devnum() {
                        if self.devices.contains_key(&devnum) {
                            debug!("Device changed: #{}", devnum);
                            callback(
                                UdevEvent::Changed {
                                    device_id: devnum,
                                    event: Uevent::from_udev(&event),
                                },
                                &mut (),
                            );
                        } else {
                            trace!("Change of untracked device #{}", devnum);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.monitor.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.monitor.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.monitor.unregister(poll)
    }
}

fn device_seat(device: &udev::Device) -> OsString {
    device
        .property_value("ID_SEAT")
        .map(|x| x.to_os_string())
        .unwrap_or_else(|| OsString::from("seat0"))
}

/// Returns the path of the primary GPU device if any
///
/// The primary GPU is the card of the seat whose PCI parent has `boot_vga` set, or the first
/// card of the seat if none has.
pub fn primary_gpu<S: AsRef<str>>(seat: S) -> io::Result<Option<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    if let Some(path) = enumerator
        .scan_devices()?
        .filter(|device| device_seat(device) == *seat.as_ref())
        .find(|device| {
            device
                .parent_with_subsystem(Path::new("pci"))
                .ok()
                .flatten()
                .and_then(|pci| pci.attribute_value("boot_vga").map(|id| id == "1"))
                .unwrap_or(false)
        })
        .and_then(|device| device.devnode().map(PathBuf::from))
    {
        debug!(?path, "Found boot vga card");
        return Ok(Some(path));
    }

    Ok(all_gpus(seat)?.into_iter().next())
}

/// Returns the paths of all available GPU devices of a seat
pub fn all_gpus<S: AsRef<str>>(seat: S) -> io::Result<Vec<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;
    let mut gpus: Vec<PathBuf> = enumerator
        .scan_devices()?
        .filter(|device| device_seat(device) == *seat.as_ref())
        .flat_map(|device| device.devnode().map(PathBuf::from))
        .collect();
    gpus.sort();
    Ok(gpus)
}

/// Returns the device node of the card named `name` (e.g. `card1`) if it belongs to `seat`
pub fn gpu_by_name<S: AsRef<str>>(seat: S, name: &str) -> io::Result<Option<PathBuf>> {
    Ok(all_gpus(seat)?
        .into_iter()
        .find(|path| path.file_name().map_or(false, |file| file == name)))
}

/// Returns the syspath of the card behind a device node
pub fn driver_syspath(path: &Path) -> io::Result<PathBuf> {
    let stat = rustix::fs::stat(path)?;
    let device = udev::Device::from_devnum(udev::DeviceType::Character, stat.st_rdev as dev_t)?;
    Ok(device.syspath().to_path_buf())
}
