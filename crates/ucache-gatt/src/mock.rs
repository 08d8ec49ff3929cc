//! Scripted in-memory transport
//!
//! Register values and notification frames are set up front; every call the
//! session makes is recorded so tests can check what reached the link.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::register::Register;
use crate::transport::{Transport, TransportError};

/// One call made against the mock link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect(String),
    Disconnect,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

#[derive(Debug, Default)]
pub struct MockTransport {
    /// Current characteristic values; writes update them
    pub values: HashMap<Uuid, Vec<u8>>,
    /// Frames queued on subscribe, per characteristic
    pub frames: HashMap<Uuid, Vec<Vec<u8>>>,
    /// Close the notification channel once queued frames are sent
    pub hang_up_after_frames: bool,
    pub fail_connect: bool,
    pub fail_disconnect: bool,
    pub fail_subscribe: bool,
    pub fail_unsubscribe: bool,
    /// Characteristics whose writes are rejected
    pub fail_writes: HashSet<Uuid>,
    /// Every call, in order
    pub calls: Vec<MockCall>,
    open: bool,
    senders: HashMap<Uuid, mpsc::Sender<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, register: Register, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert(register.uuid, value.into());
        self
    }

    pub fn with_frames(mut self, register: Register, frames: Vec<Vec<u8>>) -> Self {
        self.frames.insert(register.uuid, frames);
        self
    }

    pub fn failing_write(mut self, register: Register) -> Self {
        self.fail_writes.insert(register.uuid);
        self
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Payloads written to a register, oldest first
    pub fn writes_to(&self, register: Register) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Write(uuid, data) if *uuid == register.uuid => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of calls matching a predicate
    pub fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.iter().filter(|c| predicate(*c)).count()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, address: &str, _timeout: Duration) -> Result<(), TransportError> {
        self.calls.push(MockCall::Connect(address.to_string()));
        if self.fail_connect {
            return Err(TransportError::DeviceNotFound(address.to_string()));
        }
        self.open = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.calls.push(MockCall::Disconnect);
        self.open = false;
        self.senders.clear();
        if self.fail_disconnect {
            return Err(TransportError::Link("disconnect rejected".to_string()));
        }
        Ok(())
    }

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        self.calls.push(MockCall::Read(uuid));
        self.ensure_open()?;
        self.values
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn write(&mut self, uuid: Uuid, data: &[u8]) -> Result<(), TransportError> {
        self.calls.push(MockCall::Write(uuid, data.to_vec()));
        self.ensure_open()?;
        if self.fail_writes.contains(&uuid) {
            return Err(TransportError::Link("write rejected".to_string()));
        }
        self.values.insert(uuid, data.to_vec());
        Ok(())
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        self.calls.push(MockCall::Subscribe(uuid));
        self.ensure_open()?;
        if self.fail_subscribe {
            return Err(TransportError::Link("subscribe rejected".to_string()));
        }

        let frames = self.frames.get(&uuid).cloned().unwrap_or_default();
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            tx.try_send(frame)
                .map_err(|e| TransportError::Link(e.to_string()))?;
        }
        if !self.hang_up_after_frames {
            self.senders.insert(uuid, tx);
        }
        Ok(rx)
    }

    async fn unsubscribe(&mut self, uuid: Uuid) -> Result<(), TransportError> {
        self.calls.push(MockCall::Unsubscribe(uuid));
        self.senders.remove(&uuid);
        self.ensure_open()?;
        if self.fail_unsubscribe {
            return Err(TransportError::Link("unsubscribe rejected".to_string()));
        }
        Ok(())
    }
}
