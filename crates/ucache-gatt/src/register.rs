//! Register map and wire codecs
//!
//! Every logger register is a GATT characteristic whose UUID is a fixed base
//! with the 16-bit register id placed in the `xxxx` field:
//! `b3e0xxxx-2594-42a1-a5fe-4e660ff2868f`. Standard Bluetooth SIG
//! characteristics follow the same rule on the SIG base UUID.
//!
//! All multi-byte values are little-endian.

use std::fmt;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use ucache_core::FIXED_POINT_SCALE;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Vendor base UUID with the register id field zeroed
pub const VENDOR_BASE_UUID: u128 = 0xb3e0_0000_2594_42a1_a5fe_4e66_0ff2_868f;

/// Bluetooth SIG base UUID with the short id field zeroed
pub const SIG_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Bit offset of the 16-bit id field inside a 128-bit UUID
const ID_SHIFT: u32 = 96;

/// Substitute a register id into a base UUID
pub const fn substitute_id(base: u128, id: u16) -> Uuid {
    Uuid::from_u128(base | ((id as u128) << ID_SHIFT))
}

/// A named, independently addressable value on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub name: &'static str,
    pub id: u16,
    pub uuid: Uuid,
}

impl Register {
    /// Register in the logger's vendor service
    pub const fn vendor(name: &'static str, id: u16) -> Self {
        Self {
            name,
            id,
            uuid: substitute_id(VENDOR_BASE_UUID, id),
        }
    }

    /// Standard Bluetooth SIG characteristic
    pub const fn sig(name: &'static str, id: u16) -> Self {
        Self {
            name,
            id,
            uuid: substitute_id(SIG_BASE_UUID, id),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:04x})", self.name, self.id)
    }
}

/// Logger registers
pub mod registers {
    use super::Register;

    pub const SENSOR: Register = Register::vendor("sensor", 0x0003);
    pub const ALIAS: Register = Register::vendor("alias", 0x0004);
    pub const LIVE_SETTINGS: Register = Register::vendor("live_settings", 0x0005);
    pub const TIME: Register = Register::vendor("time", 0x000a);
    pub const LOG_FULL_TIME: Register = Register::vendor("log_full_time", 0x000c);
    pub const NB_LOGS: Register = Register::vendor("nb_logs", 0x000d);
    pub const LAST_TRANSFER: Register = Register::vendor("last_transfer", 0x000e);
    pub const LOGGING_STATUS: Register = Register::vendor("logging_status", 0x0010);
    pub const LOGGING_SETTINGS: Register = Register::vendor("logging_settings", 0x0012);
    pub const DATA: Register = Register::vendor("data", 0x0013);
    pub const ADVERTISING: Register = Register::vendor("advertising", 0x0014);

    // Device Information Service (0x180A)
    pub const MANUFACTURER_NAME: Register = Register::sig("manufacturer_name", 0x2a29);
    pub const MODEL_NUMBER: Register = Register::sig("model_number", 0x2a24);
    pub const SERIAL_NUMBER: Register = Register::sig("serial_number", 0x2a25);
    pub const FIRMWARE_REVISION: Register = Register::sig("firmware_revision", 0x2a26);
    pub const HARDWARE_REVISION: Register = Register::sig("hardware_revision", 0x2a27);

    // Battery Service (0x180F)
    pub const BATTERY_LEVEL: Register = Register::sig("battery_level", 0x2a19);
}

/// Byte shape mismatch while decoding a register value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("expected one of {expected:?} bytes, got {actual}")]
    LengthOneOf {
        expected: &'static [usize],
        actual: usize,
    },
    #[error("{0} bytes is not a whole number of 32-bit fields")]
    Misaligned(usize),
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

fn fixed<const N: usize>(bytes: &[u8]) -> DecodeResult<[u8; N]> {
    bytes.try_into().map_err(|_| DecodeError::Length {
        expected: N,
        actual: bytes.len(),
    })
}

pub fn encode_u32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn decode_u32(bytes: &[u8]) -> DecodeResult<u32> {
    Ok(u32::from_le_bytes(fixed(bytes)?))
}

pub fn encode_u8(value: u8) -> [u8; 1] {
    [value]
}

pub fn decode_u8(bytes: &[u8]) -> DecodeResult<u8> {
    Ok(fixed::<1>(bytes)?[0])
}

pub fn encode_bool(value: bool) -> [u8; 1] {
    [u8::from(value)]
}

pub fn decode_bool(bytes: &[u8]) -> DecodeResult<bool> {
    Ok(decode_u8(bytes)? != 0)
}

pub fn encode_string(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}

pub fn decode_string(bytes: &[u8]) -> DecodeResult<String> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Encode a real value as a scaled signed 32-bit integer
///
/// Values outside the i32 range saturate.
pub fn encode_fixed_point(value: f64) -> [u8; 4] {
    ((value * FIXED_POINT_SCALE).round() as i32).to_le_bytes()
}

pub fn decode_fixed_point(bytes: &[u8]) -> DecodeResult<f64> {
    Ok(i32::from_le_bytes(fixed(bytes)?) as f64 / FIXED_POINT_SCALE)
}

/// Split a payload into consecutive little-endian 32-bit words
pub fn decode_u32_words(bytes: &[u8]) -> DecodeResult<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(DecodeError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

/// Read a register's raw value
pub async fn read<T: Transport + ?Sized>(transport: &mut T, register: Register) -> Result<Vec<u8>> {
    let value = transport
        .read(register.uuid)
        .await
        .map_err(|source| Error::Transport { register, source })?;
    trace!(register = %register, bytes = ?value, "Register read");
    Ok(value)
}

/// Write a register's raw value
pub async fn write<T: Transport + ?Sized>(
    transport: &mut T,
    register: Register,
    data: &[u8],
) -> Result<()> {
    trace!(register = %register, bytes = ?data, "Register write");
    transport
        .write(register.uuid, data)
        .await
        .map_err(|source| Error::Transport { register, source })
}

/// Read a register and decode it, tagging shape errors with the register
pub async fn read_as<T, V, F>(transport: &mut T, register: Register, decode: F) -> Result<V>
where
    T: Transport + ?Sized,
    F: FnOnce(&[u8]) -> DecodeResult<V>,
{
    let bytes = read(transport, register).await?;
    decode(&bytes).map_err(|source| Error::MalformedResponse { register, source })
}
