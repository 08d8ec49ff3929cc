//! Catalog of sensors that can be installed on a logger
//!
//! The logger reports the installed sensor as a single byte. This table maps
//! that id to the number of values each log entry carries and the names and
//! units used when exporting them. Ids missing from the table are unknown.

use serde::Serialize;
use thiserror::Error;

/// Lookup of a sensor id that is not in the catalog
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unknown sensor id {0}")]
pub struct UnknownSensor(pub u8);

/// A sensor model and the outputs it logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorDescriptor {
    /// Catalog id reported by the logger
    pub id: u8,
    /// Model name (e.g., "SP-110"), None for the empty slot
    pub name: Option<&'static str>,
    /// Human-readable description
    pub description: &'static str,
    /// Number of values in each log entry
    pub output_count: usize,
    /// Column name for each output, in frame order
    pub parameter_names: &'static [&'static str],
    /// Unit for each output, in frame order
    pub unit_strings: &'static [&'static str],
}

impl SensorDescriptor {
    /// Whether a sensor is actually installed
    pub fn is_installed(&self) -> bool {
        self.id != 0
    }

    /// Model name or a placeholder for the empty slot
    pub fn display_name(&self) -> &'static str {
        self.name.unwrap_or("none")
    }
}

const fn sensor(
    id: u8,
    name: &'static str,
    description: &'static str,
    parameter_names: &'static [&'static str],
    unit_strings: &'static [&'static str],
) -> SensorDescriptor {
    SensorDescriptor {
        id,
        name: Some(name),
        description,
        output_count: parameter_names.len(),
        parameter_names,
        unit_strings,
    }
}

const W_M2: &str = "W m-2";
const PPFD: &str = "μmol m-2 s-1";
const DEG_C: &str = "°C";

/// Sensors known to the driver, ordered by id
pub static SENSOR_CATALOG: &[SensorDescriptor] = &[
    SensorDescriptor {
        id: 0,
        name: None,
        description: "No sensor chosen",
        output_count: 0,
        parameter_names: &[],
        unit_strings: &[],
    },
    sensor(1, "SP-110", "Pyranometer", &["S"], &[W_M2]),
    sensor(2, "SP-510", "Thermopile Pyranometer", &["Sin"], &[W_M2]),
    sensor(3, "SP-610", "Thermopile Pyranometer (Downward)", &["Sout"], &[W_M2]),
    sensor(4, "SQ-110", "Quantum (Electric)", &["PPFD"], &[PPFD]),
    sensor(5, "SQ-120", "Quantum (Solar)", &["PPFD_artificial"], &[PPFD]),
    sensor(6, "SQ-500", "Quantum (Full Spectrum)", &["PPFD_full"], &[PPFD]),
    // Outputs sharing one vendor parameter name are numbered in frame order
    sensor(7, "SL-510", "Pyrgeometer", &["Lin_1", "Lin_2"], &[W_M2, DEG_C]),
    sensor(8, "SL-610", "Pyrgeometer (Downward)", &["Lout_1", "Lout_2"], &[W_M2, DEG_C]),
    sensor(9, "SI-100", "IR Sensor", &["Ts_1", "Ts_2"], &[DEG_C, DEG_C]),
    sensor(10, "SU-200", "UV Sensor", &["UV"], &[W_M2]),
    sensor(11, "SE-100", "Photometric", &["Lux"], &["lm m-2"]),
    sensor(12, "S2-111", "NDVI", &["NDVI_1", "NDVI_2"], &[W_M2, W_M2]),
    sensor(13, "S2-112", "NDVI (Downward)", &["NDVIout_1", "NDVIout_2"], &[W_M2, W_M2]),
    sensor(20, "SP-700", "Albedometer", &["Sin", "Sout"], &[W_M2, W_M2]),
    sensor(26, "2 Differential", "2 Differential Measurements", &["D1", "D2"], &["mV", "mV"]),
];

/// Find the descriptor for an installed-sensor id
pub fn lookup_sensor(id: u8) -> Result<&'static SensorDescriptor, UnknownSensor> {
    SENSOR_CATALOG
        .iter()
        .find(|s| s.id == id)
        .ok_or(UnknownSensor(id))
}
