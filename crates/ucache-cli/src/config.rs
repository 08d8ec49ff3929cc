//! Configuration loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use ucache_discovery::{ScanOptions, MANUFACTURER_ID};
use ucache_gatt::TransferOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Logger address; when unset the first logger found by a scan is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Time allowed for finding and connecting to the logger
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Scan duration in seconds
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    /// Company identifier loggers advertise under
    #[serde(default = "default_manufacturer_id")]
    pub manufacturer_id: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_secs: default_scan_secs(),
            manufacturer_id: default_manufacturer_id(),
        }
    }
}

fn default_scan_secs() -> u64 {
    10
}

fn default_manufacturer_id() -> u16 {
    MANUFACTURER_ID
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_secs: u32,
    #[serde(default = "default_logging_interval")]
    pub logging_interval_secs: u32,
    /// Advertise after every n-th log entry (0: on button press only)
    #[serde(default = "default_advertising_freq")]
    pub advertising_freq: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            sampling_interval_secs: default_sampling_interval(),
            logging_interval_secs: default_logging_interval(),
            advertising_freq: default_advertising_freq(),
        }
    }
}

fn default_sampling_interval() -> u32 {
    10
}

fn default_logging_interval() -> u32 {
    60
}

fn default_advertising_freq() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum wait between two data frames
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Skip downloads with fewer entries than this
    #[serde(default = "default_min_logs")]
    pub min_logs: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            min_logs: default_min_logs(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_min_logs() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Clock drift left uncorrected, in seconds
    #[serde(default = "default_tolerance")]
    pub tolerance_secs: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: default_tolerance(),
        }
    }
}

fn default_tolerance() -> u64 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// CSV file downloaded records are appended to
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    /// CSV file setup and transfer events are appended to
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            log_file: default_log_file(),
        }
    }
}

fn default_data_file() -> PathBuf {
    PathBuf::from("./data.csv")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("./log.csv")
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.device.connect_timeout_secs)
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            duration: Duration::from_secs(self.discovery.scan_secs),
            manufacturer_id: self.discovery.manufacturer_id,
            stop_on_first: false,
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions::new().with_idle_timeout(Duration::from_secs(self.transfer.idle_timeout_secs))
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.logging.sampling_interval_secs, 10);
        assert_eq!(config.logging.logging_interval_secs, 60);
        assert_eq!(config.transfer.min_logs, 5);
        assert_eq!(config.time.tolerance_secs, 2);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ucache.toml");
        std::fs::write(
            &path,
            "[device]\naddress = \"C4:64:E3:00:11:22\"\n\n[logging]\nlogging_interval_secs = 300\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.device.address.as_deref(), Some("C4:64:E3:00:11:22"));
        assert_eq!(config.device.connect_timeout_secs, 5);
        assert_eq!(config.logging.logging_interval_secs, 300);
        assert_eq!(config.logging.sampling_interval_secs, 10);
        assert_eq!(config.output, OutputConfig::default());
    }

    #[test]
    fn test_saved_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ucache.toml");
        save_default_config(&path).unwrap();
        assert_eq!(load_config(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ucache.toml");
        std::fs::write(&path, "[logging]\nsampling_interval_secs = \"ten\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_derived_options() {
        let config = Config::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.scan_options().manufacturer_id, 0x0644);
        assert_eq!(config.transfer_options().idle_timeout, Duration::from_secs(5));
    }
}
