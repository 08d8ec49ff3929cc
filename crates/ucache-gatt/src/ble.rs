//! Transport backed by the host Bluetooth stack (btleplug)

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::transport::{Transport, TransportError, NOTIFICATION_CHANNEL_CAPACITY};

/// How often the peripheral list is polled while looking for an address
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Get the first Bluetooth adapter of the host
pub async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

/// Scan on `adapter` while `body` runs, then stop the scan whatever `body`
/// returned
pub async fn while_scanning<T, E, F>(adapter: &Adapter, body: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<btleplug::Error>,
{
    adapter.start_scan(ScanFilter::default()).await?;
    then_stop(body, adapter.stop_scan()).await
}

async fn then_stop<T, E, F, S>(body: F, stop: S) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    S: Future<Output = Result<(), btleplug::Error>>,
{
    let result = body.await;
    if let Err(e) = stop.await {
        debug!(error = %e, "Failed to stop scan");
    }
    result
}

/// Await a connection attempt, closing the link again if it fails
///
/// A timed out or half-finished attempt may have left the radio link up, so
/// `release` runs on every failure. The attempt's error is returned.
async fn connect_or_release<A, R>(attempt: A, release: R) -> Result<(), TransportError>
where
    A: Future<Output = Result<(), TransportError>>,
    R: Future<Output = Result<(), TransportError>>,
{
    let Err(e) = attempt.await else {
        return Ok(());
    };
    if let Err(secondary) = release.await {
        warn!(error = %secondary, "Releasing link after failed connect failed");
    }
    Err(e)
}

/// Whether a peripheral answers to `address`
///
/// Linux and Windows expose the MAC address; macOS only exposes an opaque
/// peripheral id, so both are accepted.
fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || peripheral.id().to_string().eq_ignore_ascii_case(address)
}

/// A single BLE link driven through btleplug
///
/// Dropping a connected transport spawns a best-effort disconnect on the
/// current tokio runtime.
pub struct BleTransport {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    forwarders: HashMap<Uuid, JoinHandle<()>>,
}

impl BleTransport {
    /// Create a transport on the host's default adapter
    pub async fn new() -> Result<Self, TransportError> {
        Ok(Self::with_adapter(default_adapter().await?))
    }

    /// Create a transport on a specific adapter
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripheral: None,
            forwarders: HashMap::new(),
        }
    }

    fn peripheral(&self) -> Result<Peripheral, TransportError> {
        self.peripheral.clone().ok_or(TransportError::NotOpen)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))?;
        Ok((peripheral, characteristic))
    }

    /// Scan until a peripheral with `address` shows up or `deadline` passes
    async fn find_peripheral(
        &self,
        address: &str,
        deadline: Instant,
    ) -> Result<Peripheral, TransportError> {
        while_scanning(&self.adapter, self.poll_for(address, deadline)).await
    }

    async fn poll_for(&self, address: &str, deadline: Instant) -> Result<Peripheral, TransportError> {
        loop {
            let peripherals = self.adapter.peripherals().await?;
            if let Some(p) = peripherals.into_iter().find(|p| matches_address(p, address)) {
                return Ok(p);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::DeviceNotFound(address.to_string()));
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    fn abort_forwarders(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self, address: &str, limit: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + limit;
        let peripheral = self.find_peripheral(address, deadline).await?;

        info!(address = %address, "Connecting");
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = async {
            timeout(remaining, peripheral.connect())
                .await
                .map_err(|_| TransportError::Timeout(limit))??;
            peripheral.discover_services().await?;
            Ok::<(), TransportError>(())
        };
        let release = async { peripheral.disconnect().await.map_err(TransportError::from) };
        connect_or_release(attempt, release).await?;

        debug!(
            address = %address,
            characteristics = peripheral.characteristics().len(),
            "Services discovered"
        );

        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.abort_forwarders();
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let (peripheral, characteristic) = self.characteristic(uuid)?;
        let value = peripheral.read(&characteristic).await?;
        trace!(uuid = %uuid, len = value.len(), "Read characteristic");
        Ok(value)
    }

    async fn write(&mut self, uuid: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.characteristic(uuid)?;
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await?;
        trace!(uuid = %uuid, len = data.len(), "Wrote characteristic");
        Ok(())
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let (peripheral, characteristic) = self.characteristic(uuid)?;
        let mut stream = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.forwarders.insert(uuid, handle) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&mut self, uuid: Uuid) -> Result<(), TransportError> {
        if let Some(handle) = self.forwarders.remove(&uuid) {
            handle.abort();
        }
        let (peripheral, characteristic) = self.characteristic(uuid)?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.abort_forwarders();
        let Some(peripheral) = self.peripheral.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!(error = %e, "Disconnect on drop failed");
                    }
                });
            }
            Err(_) => warn!("Transport dropped outside a runtime, link left open"),
        }
    }
}
