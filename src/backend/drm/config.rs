//! Backend configuration
//!
//! [`DrmBackendConfig::default`] gives the behavior a compositor usually wants. Deployments can
//! tweak it from the environment with [`DrmBackendConfig::from_env`]:
//!
//! - `XDG_SEAT` selects the seat (defaults to `seat0`),
//! - `SCANOUT_DRM_DEVICE` forces a device like `card1` instead of the primary GPU,
//! - `SCANOUT_DRM_FORMAT` overrides the pixel format of primary planes,
//! - `SCANOUT_USE_LEGACY` set to `1`, `true`, `yes` or `y` disables atomic mode-setting.

use std::time::Duration;

use drm_fourcc::DrmFourcc;
use tracing::info;

/// Errors of the configuration layer
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The pixel format name is not one the backend knows
    #[error("Unknown pixel format `{0}`, expected one of xrgb8888, argb8888, rgb565 or xrgb2101010")]
    UnknownFormat(String),
}

/// Parses a pixel format name, ignoring case
pub fn parse_format(name: &str) -> Result<DrmFourcc, ConfigError> {
    match name.trim().to_lowercase().as_str() {
        "xrgb8888" => Ok(DrmFourcc::Xrgb8888),
        "argb8888" => Ok(DrmFourcc::Argb8888),
        "rgb565" => Ok(DrmFourcc::Rgb565),
        "xrgb2101010" => Ok(DrmFourcc::Xrgb2101010),
        _ => Err(ConfigError::UnknownFormat(name.to_string())),
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}

/// Configuration of a [`DrmBackend`](super::DrmBackend)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmBackendConfig {
    /// Seat whose GPU is driven
    pub seat_id: String,
    /// Device to use instead of the primary GPU, e.g. `card1`
    pub specific_device: Option<String>,
    /// Pixel format of primary planes
    pub format: DrmFourcc,
    /// Time a commit may take to complete before the compositor gives up, `None` to wait forever
    pub pageflip_timeout: Option<Duration>,
    /// Never use the atomic mode-setting API
    pub force_legacy: bool,
    /// Submit all outputs of a repaint cycle as a single atomic commit
    pub combine_commits: bool,
    /// Never use cursor planes
    pub disable_cursor_planes: bool,
    /// Never use overlay planes, only honored on atomic KMS
    pub disable_overlay_planes: bool,
}

impl Default for DrmBackendConfig {
    fn default() -> Self {
        DrmBackendConfig {
            seat_id: String::from("seat0"),
            specific_device: None,
            format: DrmFourcc::Xrgb8888,
            pageflip_timeout: None,
            force_legacy: false,
            combine_commits: true,
            disable_cursor_planes: false,
            disable_overlay_planes: false,
        }
    }
}

impl DrmBackendConfig {
    /// Default configuration with overrides from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Default configuration with overrides from `lookup`
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = DrmBackendConfig::default();
        if let Some(seat) = lookup("XDG_SEAT").filter(|seat| !seat.is_empty()) {
            config.seat_id = seat;
        }
        if let Some(device) = lookup("SCANOUT_DRM_DEVICE").filter(|device| !device.is_empty()) {
            config.specific_device = Some(device);
        }
        if let Some(format) = lookup("SCANOUT_DRM_FORMAT") {
            config.format = parse_format(&format)?;
        }
        if lookup("SCANOUT_USE_LEGACY").map_or(false, |value| is_truthy(&value)) {
            info!("SCANOUT_USE_LEGACY is set, forcing legacy mode-setting");
            config.force_legacy = true;
        }
        Ok(config)
    }

    /// Sets the seat
    pub fn with_seat(mut self, seat_id: impl Into<String>) -> Self {
        self.seat_id = seat_id.into();
        self
    }

    /// Forces a device instead of the primary GPU
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.specific_device = Some(device.into());
        self
    }

    /// Sets the pixel format of primary planes
    pub fn with_format(mut self, format: DrmFourcc) -> Self {
        self.format = format;
        self
    }

    /// Sets the pageflip timeout
    pub fn with_pageflip_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pageflip_timeout = timeout;
        self
    }

    /// Disables atomic mode-setting
    pub fn with_force_legacy(mut self, force_legacy: bool) -> Self {
        self.force_legacy = force_legacy;
        self
    }

    /// Chooses between one atomic commit per repaint cycle and one per output
    pub fn with_combine_commits(mut self, combine_commits: bool) -> Self {
        self.combine_commits = combine_commits;
        self
    }

    /// Disables cursor and overlay planes
    pub fn with_disabled_planes(mut self, cursors: bool, overlays: bool) -> Self {
        self.disable_cursor_planes = cursors;
        self.disable_overlay_planes = overlays;
        self
    }
}
