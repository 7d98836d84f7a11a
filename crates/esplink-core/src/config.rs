//! Device configuration and its storage.
//!
//! Storage is abstracted so the same settings can live in a JSON file on
//! Linux or in flash on a device:
//! - `FileConfigStorage` reads and writes a single JSON document
//! - Tests use an in-memory implementation

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use esplink_protocol::MAX_LINE_LEN;
use serde::{Deserialize, Serialize};

use crate::peripheral::{BoardLayout, BoardProfile, MAX_ANALOG_SAMPLES};

/// Shared secret the stock firmware ships with.
pub const DEFAULT_SECRET: &str = "IoTDevice2024";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CLIENTS: usize = 5;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_STATUS_LOG_INTERVAL_MS: u64 = 10_000;

/// Errors that can occur during configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// No configuration has been stored yet.
    NotFound(String),
    /// Failed to read configuration.
    ReadError(String),
    /// Failed to write configuration.
    WriteError(String),
    /// Configuration data is invalid.
    InvalidData(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(key) => write!(f, "Configuration not found: {}", key),
            ConfigError::ReadError(msg) => write!(f, "Read error: {}", msg),
            ConfigError::WriteError(msg) => write!(f, "Write error: {}", msg),
            ConfigError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Settings
// ============================================================================

/// Runtime settings of a device node.
///
/// Missing fields fall back to the firmware defaults, so a partial JSON
/// file such as `{"secret":"hunter2"}` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceSettings {
    /// Shared authentication secret.
    pub secret: String,

    /// TCP port the server listens on.
    pub port: u16,

    /// Session table capacity.
    pub max_clients: usize,

    /// Idle time after which a session is evicted.
    pub heartbeat_timeout_ms: u64,

    /// Period of the status broadcast.
    pub broadcast_interval_ms: u64,

    /// Period of the idle/disconnect reaper.
    pub reap_interval_ms: u64,

    /// Period of the session summary log line.
    pub status_log_interval_ms: u64,

    /// Pin layout and firmware variant.
    pub board: BoardLayout,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            secret: DEFAULT_SECRET.to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            reap_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            status_log_interval_ms: DEFAULT_STATUS_LOG_INTERVAL_MS,
            board: BoardLayout::default(),
        }
    }
}

impl DeviceSettings {
    /// Default settings for a firmware variant.
    pub fn for_profile(profile: BoardProfile) -> Self {
        Self {
            board: BoardLayout::for_profile(profile),
            ..Self::default()
        }
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::InvalidData("secret must not be empty".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::InvalidData(
                "maxClients must be at least 1".into(),
            ));
        }
        if self.heartbeat_timeout_ms == 0
            || self.broadcast_interval_ms == 0
            || self.reap_interval_ms == 0
            || self.status_log_interval_ms == 0
        {
            return Err(ConfigError::InvalidData(
                "timeouts and intervals must be greater than zero".into(),
            ));
        }

        let board = &self.board;
        let channels = usize::from(u8::MAX);
        if board.led_pins.len() > channels
            || board.button_pins.len() > channels
            || board.servo_pins.len() > channels
        {
            return Err(ConfigError::InvalidData("too many channels".into()));
        }
        if board.profile != BoardProfile::LedPanel && board.servo_pins.is_empty() {
            return Err(ConfigError::InvalidData(
                "servo profiles need at least one servo pin".into(),
            ));
        }
        if !(1..=MAX_ANALOG_SAMPLES).contains(&board.analog_samples) {
            return Err(ConfigError::InvalidData(format!(
                "analogSamples must be between 1 and {}",
                MAX_ANALOG_SAMPLES
            )));
        }
        // Peers reassemble lines up to MAX_LINE_LEN; longer status lines
        // would never arrive.
        if board.max_status_len() > MAX_LINE_LEN {
            return Err(ConfigError::InvalidData(format!(
                "board layout too large: status lines would exceed {} bytes",
                MAX_LINE_LEN
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Abstract configuration storage.
///
/// All methods are synchronous to support embedded platforms.
pub trait ConfigStorage: Send + Sync {
    /// Load stored settings.
    fn load_settings(&self) -> Result<DeviceSettings, ConfigError>;

    /// Persist settings.
    fn save_settings(&self, settings: &DeviceSettings) -> Result<(), ConfigError>;

    /// Load stored settings, or the defaults if none were saved yet.
    fn load_or_default(&self) -> Result<DeviceSettings, ConfigError> {
        match self.load_settings() {
            Err(ConfigError::NotFound(_)) => Ok(DeviceSettings::default()),
            other => other,
        }
    }
}

/// Settings stored as one pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct FileConfigStorage {
    path: PathBuf,
}

impl FileConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load_settings(&self) -> Result<DeviceSettings, ConfigError> {
        let text = fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ConfigError::NotFound(self.path.display().to_string()),
            _ => ConfigError::ReadError(format!("{}: {}", self.path.display(), e)),
        })?;
        let settings: DeviceSettings =
            serde_json::from_str(&text).map_err(|e| ConfigError::InvalidData(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn save_settings(&self, settings: &DeviceSettings) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        }
        fs::write(&self.path, json).map_err(|e| ConfigError::WriteError(e.to_string()))
    }
}
