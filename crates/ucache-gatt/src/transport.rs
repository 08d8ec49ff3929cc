//! Transport adapter boundary
//!
//! A transport is one physical link to one device. It knows nothing about
//! registers: bytes go in and come out keyed by characteristic UUID.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of the channel that carries notification frames
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("No Bluetooth adapter found")]
    NoAdapter,
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Link not open")]
    NotOpen,
    #[error("Link error: {0}")]
    Link(String),
}

/// Raw access to a single device link
///
/// Implementations are driven by one session at a time and are not expected
/// to handle concurrent operations on the same link.
#[async_trait]
pub trait Transport: Send {
    /// Open the link to `address`, giving up after `timeout`
    async fn connect(&mut self, address: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Read the current value of a characteristic
    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Write a value to a characteristic, with response
    async fn write(&mut self, uuid: Uuid, data: &[u8]) -> Result<(), TransportError>;

    /// Enable notifications on a characteristic
    ///
    /// Frames arrive on the returned channel in the order the device sent
    /// them. The channel closes when the link goes away.
    async fn subscribe(&mut self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Disable notifications on a characteristic
    async fn unsubscribe(&mut self, uuid: Uuid) -> Result<(), TransportError>;
}
