//! Configuration management.
//!
//! Session settings load from TOML through the `config` crate, mirroring
//! how the rest of the crate is parameterized: everything has a sensible
//! default, so `Settings::default()` is a working hardware session and a
//! settings file only overrides what differs.

use crate::error::RigError;
use config::Config;
use serde::Deserialize;

/// Which inbound wire variant the firmware was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMode {
    /// Snapshot values only; fast, but a delayed tick can miss
    /// millisecond changes.
    Direct,
    /// Firmware-side change histories with timestamps; guarantees
    /// millisecond-precision sensor data.
    Archivist,
}

/// How the session talks to the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// A physical rig over the serial link.
    Hardware,
    /// Hardware-free piloting with keyboard-driven inputs.
    Keyboard,
    /// Hardware-free operation driven by a scripted agent.
    Agent,
}

/// Session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Explicit port path, or a substring of the device's hardware
    /// identification (vendor id, serial number, product name).
    pub serial_identifier: String,
    pub wire_mode: WireMode,
    pub mode: OperationMode,
    /// Root directory for session log folders; `None` keeps the log in
    /// memory only.
    pub log_root: Option<String>,
    /// Upper bound on the synchronization loop rate.
    pub max_tick_rate_hz: f64,
    /// Whether the start handshake begins immediately, or waits for an
    /// explicit start call.
    pub autostart: bool,
    /// Record per-tick loop and exchange timestamps.
    pub log_performance: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            serial_identifier: "USB Serial".to_string(),
            wire_mode: WireMode::Archivist,
            mode: OperationMode::Hardware,
            log_root: Some("./".to_string()),
            max_tick_rate_hz: 8_000.0,
            autostart: true,
            log_performance: false,
        }
    }
}

impl Settings {
    /// Load `config/<name>.toml`, defaulting to `config/default.toml`.
    pub fn new(config_name: Option<&str>) -> Result<Self, RigError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(RigError::Config)?;

        s.try_deserialize().map_err(RigError::Config)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml_str(source: &str) -> Result<Self, RigError> {
        toml::from_str(source).map_err(|e| RigError::Configuration(e.to_string()))
    }
}
