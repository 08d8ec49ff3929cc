//! ucache GATT - register protocol and log transfer for ucache loggers
//!
//! A [`DeviceSession`] owns one [`Transport`] and turns typed requests into
//! register reads and writes. The log transfer engine drains the device's log
//! buffer through the notification stream of the data register.

pub mod ble;
pub mod clock;
pub mod error;
pub mod mock;
pub mod register;
pub mod session;
pub mod settings;
pub mod transfer;
pub mod transport;

pub use ble::BleTransport;
pub use clock::{TimeSync, TimeSyncAction, MAX_CORRECTABLE_DRIFT_S};
pub use error::{Error, Result};
pub use register::{DecodeError, Register};
pub use session::{ConnectionState, DeviceSession, DEFAULT_CONNECT_TIMEOUT};
pub use settings::{normalize_intervals, quantize_live_average};
pub use transfer::{
    LogTransfer, TransferEnd, TransferOptions, TransferProgress, TransferReport, TransferState,
};
pub use transport::{Transport, TransportError};
