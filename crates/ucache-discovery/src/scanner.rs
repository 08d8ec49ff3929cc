//! Advertisement scanner

use btleplug::api::{Central, Peripheral as _};
use btleplug::platform::Adapter;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::info;

use ucache_gatt::ble::{default_adapter, while_scanning};
use ucache_gatt::TransportError;

/// Bluetooth SIG company identifier carried in logger advertisements
pub const MANUFACTURER_ID: u16 = 0x0644;

/// How often the adapter's peripheral list is polled
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Adapter unavailable: {0}")]
    Adapter(#[from] TransportError),
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to scan
    pub duration: Duration,
    /// Company identifier to filter on
    pub manufacturer_id: u16,
    /// Return as soon as one device matches
    pub stop_on_first: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            manufacturer_id: MANUFACTURER_ID,
            stop_on_first: false,
        }
    }
}

/// A logger seen advertising
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Address to hand to a session
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub company_id: u16,
    /// Manufacturer-specific payload following the company identifier
    pub advertised_data: Vec<u8>,
}

/// Build a discovered device from advertisement fields, if it carries
/// manufacturer data under `manufacturer_id`
pub fn match_advertisement(
    address: &str,
    name: Option<&str>,
    rssi: Option<i16>,
    manufacturer_data: &HashMap<u16, Vec<u8>>,
    manufacturer_id: u16,
) -> Option<DiscoveredDevice> {
    let data = manufacturer_data.get(&manufacturer_id)?;
    Some(DiscoveredDevice {
        address: address.to_string(),
        name: name.map(str::to_string),
        rssi,
        company_id: manufacturer_id,
        advertised_data: data.clone(),
    })
}

/// Scan the default adapter for loggers
pub async fn scan(options: &ScanOptions) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let adapter = default_adapter().await?;
    scan_adapter(&adapter, options).await
}

/// Scan a specific adapter for loggers
///
/// Devices are returned in the order they were first seen.
pub async fn scan_adapter(
    adapter: &Adapter,
    options: &ScanOptions,
) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    info!(
        duration = ?options.duration,
        manufacturer_id = %format!("{:#06x}", options.manufacturer_id),
        "Starting BLE scan"
    );
    let found = while_scanning(adapter, collect(adapter, options)).await?;
    info!(found = found.len(), "Scan complete");
    Ok(found)
}

/// Poll the adapter's peripherals until the scan window closes
async fn collect(
    adapter: &Adapter,
    options: &ScanOptions,
) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let deadline = Instant::now() + options.duration;
    let mut found: Vec<DiscoveredDevice> = Vec::new();

    loop {
        for peripheral in adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            let address = properties.address.to_string();
            if found.iter().any(|d| d.address == address) {
                continue;
            }
            if let Some(device) = match_advertisement(
                &address,
                properties.local_name.as_deref(),
                properties.rssi,
                &properties.manufacturer_data,
                options.manufacturer_id,
            ) {
                info!(address = %device.address, name = ?device.name, rssi = ?device.rssi, "Found logger");
                found.push(device);
                if options.stop_on_first {
                    return Ok(found);
                }
            }
        }

        if Instant::now() >= deadline {
            return Ok(found);
        }
        sleep(POLL_INTERVAL).await;
    }
}
