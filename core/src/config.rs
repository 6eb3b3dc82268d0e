//! Session configuration
//!
//! Serializable to/from JSON so embedders can ship it next to their own
//! settings file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Scan window used when the caller does not pass one.
pub const DEFAULT_SCAN_PERIOD_MS: u64 = 2000;

/// Connection timeout used when the caller does not pass one.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Tunables for a [`crate::session::BleSession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Scan window when `scan` arrives without a period
    pub default_scan_period_ms: u64,
    /// Connection timeout when `connect` arrives without one
    pub default_connect_timeout_ms: u64,
    /// Ask the native stack to keep reconnecting on its own where supported
    pub auto_reconnect: bool,
    /// Emit `onStopScan(true)` when a scan window is closed by something
    /// other than its own timer (restart, connect, disconnect)
    pub announce_explicit_stop: bool,
    /// Capacity of the command channel in front of the session
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_scan_period_ms: DEFAULT_SCAN_PERIOD_MS,
            default_connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            auto_reconnect: true,
            announce_explicit_stop: true,
            command_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid(
                "command_buffer must be > 0".to_string(),
            ));
        }
        if self.default_connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_connect_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_scan_period(&self) -> Duration {
        Duration::from_millis(self.default_scan_period_ms)
    }

    pub fn default_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.default_connect_timeout_ms)
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }
}
