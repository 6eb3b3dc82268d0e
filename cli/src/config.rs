// Configuration management for the bleprint CLI
//
// Stored as JSON in:
// - Linux: ~/.config/bleprint/config.json
// - macOS: ~/Library/Application Support/bleprint/config.json
// - Windows: %APPDATA%\bleprint\config.json

use anyhow::{Context, Result};
use bleprint_core::platform::SimulatedDevice;
use bleprint_core::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Session tunables handed to the core
    #[serde(default)]
    pub session: SessionConfig,

    /// Peripherals served by the `--simulate` stack
    #[serde(default = "default_devices")]
    pub simulated_devices: Vec<SimulatedDevice>,
}

fn default_devices() -> Vec<SimulatedDevice> {
    vec![
        SimulatedDevice::new("AA:BB:CC:DD:EE:01", Some("Printer")).bonded(),
        SimulatedDevice::new("AA:BB:CC:DD:EE:02", Some("Thermometer")),
        SimulatedDevice::new("AA:BB:CC:DD:EE:03", None),
        SimulatedDevice::new("AA:BB:CC:DD:EE:04", Some("Doorbell")).unreachable(),
    ]
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            simulated_devices: default_devices(),
        }
    }
}

impl CliConfig {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("bleprint");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: CliConfig =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .session
                .validate()
                .context("Invalid session settings in config file")?;
            Ok(config)
        } else {
            let config = CliConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Overwrite the file with defaults
    pub fn reset() -> Result<Self> {
        let config = CliConfig::default();
        config.save()?;
        Ok(config)
    }

    /// Set a session value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a session value in memory, rejecting values the session would refuse
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut session = self.session.clone();
        match key {
            "default_scan_period_ms" => {
                session.default_scan_period_ms = value.parse().context("Invalid duration")?;
            }
            "default_connect_timeout_ms" => {
                session.default_connect_timeout_ms = value.parse().context("Invalid duration")?;
            }
            "auto_reconnect" => {
                session.auto_reconnect = value.parse().context("Invalid boolean")?;
            }
            "announce_explicit_stop" => {
                session.announce_explicit_stop = value.parse().context("Invalid boolean")?;
            }
            "command_buffer" => {
                session.command_buffer = value.parse().context("Invalid buffer size")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        session.validate().context("Rejected value")?;
        self.session = session;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let session = &self.session;
        vec![
            (
                "default_scan_period_ms".to_string(),
                session.default_scan_period_ms.to_string(),
            ),
            (
                "default_connect_timeout_ms".to_string(),
                session.default_connect_timeout_ms.to_string(),
            ),
            ("auto_reconnect".to_string(), session.auto_reconnect.to_string()),
            (
                "announce_explicit_stop".to_string(),
                session.announce_explicit_stop.to_string(),
            ),
            ("command_buffer".to_string(), session.command_buffer.to_string()),
        ]
    }
}
