//! Agent configuration.
//!
//! Defaults live here as constants so every crate agrees on them. The
//! configuration itself is resolved in priority order:
//! 1. An explicit TOML file passed by the caller
//! 2. `config.toml` in the working directory
//! 3. Built-in defaults
//!
//! Environment variables are applied on top of whichever source was used.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default values shared across crates.
pub mod defaults {
    /// Default capacity of the observation ring buffer.
    pub const BUFFER_SIZE: usize = 1000;
    /// Largest sequence number before the allocator wraps to 0.
    pub const MAX_SEQUENCE: u64 = 9_007_199_254_740_991;
    /// Schema protocol version tag reported in probe headers.
    pub const SCHEMA_VERSION: &str = "1.3";
    /// Sender reported in probe headers.
    pub const SENDER: &str = "localhost";
    /// Config file looked up in the working directory.
    pub const CONFIG_FILE: &str = "config.toml";
}

/// Environment variable names.
pub mod env_vars {
    use super::defaults;

    pub const CONFIG_PATH: &str = "MTC_CONFIG";
    pub const BUFFER_SIZE: &str = "MTC_BUFFER_SIZE";
    pub const SENDER: &str = "MTC_SENDER";
    pub const LOG_JSON: &str = "MTC_LOG_JSON";

    /// Buffer size from the environment, if set and valid.
    pub fn buffer_size() -> Option<usize> {
        std::env::var(BUFFER_SIZE)
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
    }

    /// Sender name from the environment, or the default.
    pub fn sender() -> String {
        std::env::var(SENDER).unwrap_or_else(|_| defaults::SENDER.to_string())
    }

    /// Whether JSON log output is requested.
    pub fn log_json() -> bool {
        std::env::var(LOG_JSON)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false)
    }
}

/// Per-device ingestion behavior, resolved once when a device schema is
/// ingested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Drop values equal to the current value (non-discrete items only).
    pub filter_duplicates: bool,
    /// Report AVAILABLE for availability items without an adapter value.
    pub auto_available: bool,
    /// Rebase adapter timestamps onto the agent clock.
    pub relative_time: bool,
    /// Replace adapter timestamps with the agent clock.
    pub ignore_timestamps: bool,
    /// Apply unit conversion to items that declare it.
    pub conversion_required: bool,
    /// Uppercase incoming values.
    pub upcase_values: bool,
    /// Ignore `* uuid:` commands from the adapter.
    pub preserve_uuid: bool,
}

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Observation buffer capacity.
    pub buffer_size: usize,
    /// Sender reported in probe headers.
    pub sender: String,
    /// Settings applied to devices without an explicit entry.
    pub defaults: DeviceSettings,
    /// Per-device overrides keyed by device name.
    pub devices: HashMap<String, DeviceSettings>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            buffer_size: defaults::BUFFER_SIZE,
            sender: defaults::SENDER.to_string(),
            defaults: DeviceSettings::default(),
            devices: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Resolve configuration from the best available source, then apply
    /// environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            info!(category = "config", "Loading config from: {}", path.display());
            Self::from_file(path)?
        } else if let Ok(path) = std::env::var(env_vars::CONFIG_PATH) {
            info!(category = "config", "Loading config from: {} (env)", path);
            Self::from_file(&path)?
        } else if Path::new(defaults::CONFIG_FILE).exists() {
            info!(category = "config", "Loading config from: {}", defaults::CONFIG_FILE);
            Self::from_file(defaults::CONFIG_FILE)?
        } else {
            info!(category = "config", "No config file found, using defaults");
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Some(size) = env_vars::buffer_size() {
            self.buffer_size = size;
        }
        if let Ok(sender) = std::env::var(env_vars::SENDER) {
            self.sender = sender;
        }
    }

    /// Settings for a device by name, falling back to the defaults.
    pub fn settings_for(&self, device_name: &str) -> DeviceSettings {
        match self.devices.get(device_name) {
            Some(settings) => settings.clone(),
            None => self.defaults.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be greater than 0".to_string()));
        }
        if self.sender.trim().is_empty() {
            warn!(category = "config", "Empty sender configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.sender, "localhost");
        assert!(!config.defaults.filter_duplicates);
    }

    #[test]
    fn test_from_toml_with_device_overrides() {
        let config = AgentConfig::from_toml(
            r#"
            buffer_size = 16

            [defaults]
            filter_duplicates = true

            [devices.VMC-3Axis]
            auto_available = true
            relative_time = true
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer_size, 16);
        assert_eq!(config.sender, "localhost");

        let vmc = config.settings_for("VMC-3Axis");
        assert!(vmc.auto_available);
        assert!(vmc.relative_time);
        assert!(!vmc.filter_duplicates);

        let other = config.settings_for("Mazak");
        assert!(other.filter_duplicates);
        assert!(!other.auto_available);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = AgentConfig::from_toml("buffer_size = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(AgentConfig::from_toml("buffer_size = [").is_err());
    }
}
