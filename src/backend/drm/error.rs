use drm::control::{connector, crtc, Mode, RawResourceHandle};
use std::{io, path::PathBuf};

use super::{OutputId, PlaneId};

/// Errors thrown by the [`DrmBackend`](super::DrmBackend) and the kernel interface it drives.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The kernel rejected a request
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The device lacks CRTCs, connectors or encoders
    #[error("Device `{0:?}` is not capable of mode-setting")]
    NotKmsCapable(Option<PathBuf>),
    /// The session does not currently own the display
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// The given output does not exist (anymore)
    #[error("Unknown output `{0:?}`")]
    UnknownOutput(OutputId),
    /// The given connector is not known to the backend
    #[error("Unknown connector `{0:?}`")]
    UnknownConnector(connector::Handle),
    /// The head is already driven by another output
    #[error("Connector `{connector:?}` is already attached to output `{output:?}`")]
    HeadAlreadyAttached {
        /// Connector
        connector: connector::Handle,
        /// Output currently holding the head
        output: OutputId,
    },
    /// The output already drives the maximum number of cloned heads
    #[error("Output `{output}` cannot drive more than {limit} heads")]
    TooManyHeads {
        /// Output name
        output: String,
        /// Clone limit
        limit: usize,
    },
    /// The output has no heads attached
    #[error("Output `{0}` has no heads attached")]
    NoHeads(String),
    /// No mode could be determined for the output
    #[error("Output `{0}` has no usable mode")]
    NoMode(String),
    /// Mode is not compatible with the heads of the output
    #[error("Mode `{0:?}` is not supported by the heads of the output")]
    ModeNotSuitable(Mode),
    /// The operation needs an enabled output
    #[error("Output `{0}` is not enabled")]
    OutputDisabled(String),
    /// The output state has nothing to scan out on the primary plane
    #[error("No framebuffer to scan out on output `{0}`")]
    MissingFramebuffer(String),
    /// No free CRTC could drive every head of the output
    #[error("No CRTC available for output `{0}`")]
    NoCrtcAvailable(String),
    /// No primary plane could be reserved for the output
    #[error("No primary plane available for output `{0}` on crtc `{1:?}`")]
    NoPrimaryPlane(String, crtc::Handle),
    /// A property required for the operation is missing
    #[error("The object ({handle:?}) is missing the required property '{name}'")]
    UnknownProperty {
        /// Object handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// The buffer cannot be scanned out by the plane
    #[error("Format {0} is not supported by the plane")]
    UnsupportedFormat(String),
    /// The output still waits for its previous commit to complete
    #[error("Output `{0}` still has a commit in flight")]
    CommitInFlight(String),
    /// The plane cannot be used by the output right now
    #[error("Plane `{plane:?}` is not available to output `{output}`")]
    PlaneUnavailable {
        /// Plane
        plane: PlaneId,
        /// Output name
        output: String,
    },
    /// The requested stacking position is outside of the plane's range or below the primary plane
    #[error("Plane `{plane:?}` cannot be placed at zpos {zpos}")]
    ZposOutOfRange {
        /// Plane
        plane: PlaneId,
        /// Requested position
        zpos: u64,
    },
    /// The gamma ramp does not match the size of the CRTC's gamma table
    #[error("Gamma ramp of size {got} does not match the crtc gamma size {expected}")]
    GammaSizeMismatch {
        /// Gamma table size of the crtc
        expected: u32,
        /// Size of the supplied ramp
        got: usize,
    },
    /// The render path failed to produce a frame
    #[error("Rendering failed")]
    Render(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Accessing the backlight failed
    #[error("Backlight access failed")]
    Backlight(#[source] io::Error),
}

impl Error {
    /// Returns true if the kernel refused the request because this process
    /// does not own the display (anymore).
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Access(err) => err.is_permission_denied(),
            Error::DeviceInactive => true,
            _ => false,
        }
    }
}

/// The kernel refused a request
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl AccessError {
    /// Returns true for `EACCES`-class failures, meaning drm master was lost
    pub fn is_permission_denied(&self) -> bool {
        self.source.kind() == io::ErrorKind::PermissionDenied
            || self.source.raw_os_error() == Some(libc::EACCES)
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessError, Error};
    use std::io;

    fn access(source: io::Error) -> Error {
        Error::Access(AccessError {
            errmsg: "test",
            dev: None,
            source,
        })
    }

    #[test]
    fn classifies_permission_loss() {
        assert!(access(io::Error::from_raw_os_error(libc::EACCES)).is_permission_denied());
        assert!(access(io::Error::from(io::ErrorKind::PermissionDenied)).is_permission_denied());
        assert!(Error::DeviceInactive.is_permission_denied());
    }

    #[test]
    fn transient_failures_are_not_fatal() {
        assert!(!access(io::Error::from_raw_os_error(libc::EBUSY)).is_permission_denied());
        assert!(!access(io::Error::from_raw_os_error(libc::EINVAL)).is_permission_denied());
        assert!(!Error::NoCrtcAvailable("HDMI-A-1".into()).is_permission_denied());
    }
}
