//! ucache Discovery - find loggers by their BLE advertisements
//!
//! Loggers advertise manufacturer-specific data under a fixed Bluetooth SIG
//! company identifier. Scanning collects every peripheral carrying it.

pub mod scanner;

pub use scanner::{scan, DiscoveredDevice, DiscoveryError, ScanOptions, MANUFACTURER_ID};
