use thiserror::Error;

use ucache_core::UnknownSensor;

use crate::register::{DecodeError, Register};
use crate::transport::TransportError;

/// Errors surfaced by a device session
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("Not connected to device")]
    NotConnected,

    #[error("Malformed response from {register}: {source}")]
    MalformedResponse {
        register: Register,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    UnknownSensor(#[from] UnknownSensor),

    #[error("Subscription to {register} failed: {source}")]
    Subscription {
        register: Register,
        #[source]
        source: TransportError,
    },

    #[error("Transport error on {register}: {source}")]
    Transport {
        register: Register,
        #[source]
        source: TransportError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
