//! ucache Core - Core types and the sensor catalog
//!
//! This crate provides the foundational types for the ucache driver:
//! - Device information, logging settings and log buffer counters
//! - Decoded log records with their fixed-point values
//! - The static catalog of sensors a logger can have installed
//! - Header and row formatting for the persistence boundary

pub mod device;
pub mod export;
pub mod sensor;

pub use device::{DeviceInfo, LogCounts, LogRecord, LoggingSettings, FIXED_POINT_SCALE};
pub use export::{data_header, data_row, format_timestamp};
pub use sensor::{lookup_sensor, SensorDescriptor, UnknownSensor, SENSOR_CATALOG};
