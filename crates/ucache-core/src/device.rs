//! Device types read from and written to a logger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Factor by which transmitted sample values are scaled (exponent -4)
pub const FIXED_POINT_SCALE: f64 = 10_000.0;

/// Device Information Service strings
///
/// Populated by the session on the first info read and kept until the
/// session disconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Manufacturer name (e.g., "Apogee Instruments")
    pub manufacturer_name: String,
    /// Model number (e.g., "uCache")
    pub model_number: String,
    /// Serial number
    pub serial_number: String,
    /// Firmware revision
    pub firmware_revision: String,
    /// Hardware revision
    pub hardware_revision: String,
}

impl DeviceInfo {
    /// Manufacturer and model joined for display
    pub fn device_type(&self) -> String {
        format!("{} {}", self.manufacturer_name, self.model_number)
            .trim()
            .to_string()
    }
}

/// Sampling and logging cadence of the onboard logger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// How often the sensor is sampled, in seconds
    pub sampling_interval_s: u32,
    /// How often the averaged samples are logged, in seconds
    pub logging_interval_s: u32,
    /// Unix time at which logging starts (None starts immediately)
    pub start_time: Option<u32>,
}

impl LoggingSettings {
    pub fn new(sampling_interval_s: u32, logging_interval_s: u32) -> Self {
        Self {
            sampling_interval_s,
            logging_interval_s,
            start_time: None,
        }
    }

    pub fn with_start_time(mut self, start_time: u32) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Number of samples averaged into each log entry
    pub fn samples_per_log(&self) -> u32 {
        if self.sampling_interval_s == 0 {
            return 0;
        }
        self.logging_interval_s / self.sampling_interval_s
    }
}

/// Log buffer counters reported by the device
///
/// Only the first counter (entries available for transfer) has a known
/// meaning; the other two are kept verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCounts(pub [u32; 3]);

impl LogCounts {
    /// Entries waiting to be transferred
    pub fn available(&self) -> u32 {
        self.0[0]
    }
}

/// One stored log entry as decoded from a transfer frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unix time of the entry, in seconds
    pub timestamp: u32,
    /// Values as transmitted, each scaled by [`FIXED_POINT_SCALE`]
    pub raw_values: Vec<i32>,
}

impl LogRecord {
    pub fn new(timestamp: u32, raw_values: Vec<i32>) -> Self {
        Self {
            timestamp,
            raw_values,
        }
    }

    /// Values in real-world units
    pub fn values(&self) -> Vec<f64> {
        self.raw_values
            .iter()
            .map(|&raw| raw as f64 / FIXED_POINT_SCALE)
            .collect()
    }

    /// Entry time as a UTC datetime
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_record_values_are_scaled() {
        let record = LogRecord::new(100, vec![50000, -50000, 12345]);
        assert_eq!(record.values(), vec![5.0, -5.0, 1.2345]);
    }

    #[test]
    fn test_log_record_datetime() {
        let record = LogRecord::new(1_700_000_000, Vec::new());
        let dt = record.datetime().unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_log_counts_available() {
        let counts = LogCounts([42, 7, 0]);
        assert_eq!(counts.available(), 42);
    }

    #[test]
    fn test_samples_per_log() {
        assert_eq!(LoggingSettings::new(10, 60).samples_per_log(), 6);
        assert_eq!(LoggingSettings::new(0, 60).samples_per_log(), 0);
    }

    #[test]
    fn test_device_type() {
        let info = DeviceInfo {
            manufacturer_name: "Apogee".to_string(),
            model_number: "uCache".to_string(),
            ..Default::default()
        };
        assert_eq!(info.device_type(), "Apogee uCache");
    }
}
