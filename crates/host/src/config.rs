//! Host configuration management

use anyhow::{Context, Result, anyhow};
use common::logging::LOG_LEVELS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted control data stage (wLength is 16 bits)
const MAX_CONTROL_BUFFER: usize = u16::MAX as usize;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
    #[serde(default)]
    pub events: EventSettings,
    #[serde(default)]
    pub isochronous: IsochronousSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level when RUST_LOG is unset
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Timeout for transfers that don't specify one (0 = wait forever)
    #[serde(default = "TransferSettings::default_timeout")]
    pub default_timeout_ms: u32,
    /// Buffer size for device-to-host control requests
    #[serde(default = "TransferSettings::default_control_buffer")]
    pub control_buffer_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout(),
            control_buffer_size: Self::default_control_buffer(),
        }
    }
}

impl TransferSettings {
    fn default_timeout() -> u32 {
        1000
    }

    fn default_control_buffer() -> usize {
        256
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// How long each pump iteration blocks waiting for events
    #[serde(default = "EventSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Start the event pump as soon as the host is up
    #[serde(default)]
    pub auto_start_pump: bool,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
            auto_start_pump: false,
        }
    }
}

impl EventSettings {
    fn default_poll_interval() -> u64 {
        100
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsochronousSettings {
    /// Packets per isochronous transfer
    #[serde(default = "IsochronousSettings::default_packets")]
    pub default_packets: usize,
    /// Packet size used when the endpoint reports none
    #[serde(default)]
    pub packet_size: Option<usize>,
}

impl Default for IsochronousSettings {
    fn default() -> Self {
        Self {
            default_packets: Self::default_packets(),
            packet_size: None,
        }
    }
}

impl IsochronousSettings {
    fn default_packets() -> usize {
        8
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path the user config and then the system config are tried.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => [Self::default_path(), Self::system_path()]
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-xfer").join("host.toml")
        } else {
            PathBuf::from(".config/usb-xfer/host.toml")
        }
    }

    pub fn system_path() -> PathBuf {
        PathBuf::from("/etc/usb-xfer/host.toml")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.transfers.control_buffer_size > MAX_CONTROL_BUFFER {
            return Err(anyhow!(
                "control_buffer_size {} exceeds the maximum control data stage of {} bytes",
                self.transfers.control_buffer_size,
                MAX_CONTROL_BUFFER
            ));
        }

        if self.events.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }

        if self.isochronous.default_packets == 0 {
            return Err(anyhow!("isochronous default_packets must be greater than 0"));
        }

        if self.isochronous.packet_size == Some(0) {
            return Err(anyhow!("isochronous packet_size must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.transfers.default_timeout_ms, 1000);
        assert_eq!(config.events.poll_interval(), Duration::from_millis(100));
        assert!(!config.events.auto_start_pump);
        assert_eq!(config.isochronous.packet_size, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: HostConfig = toml::from_str("[events]\nauto_start_pump = true\n").unwrap();
        assert!(config.events.auto_start_pump);
        assert_eq!(config.events.poll_interval_ms, 100);
        assert_eq!(config.transfers.control_buffer_size, 256);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = HostConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = HostConfig::default();
        config.events.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.transfers.control_buffer_size = 70_000;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.isochronous.packet_size = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = HostConfig::default();
        config.isochronous.packet_size = Some(192);
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HostConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.logging.level, config.logging.level);
        assert_eq!(parsed.isochronous.packet_size, Some(192));
    }
}
