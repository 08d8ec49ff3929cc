//! Device session lifecycle and typed register operations
//!
//! A session is `Disconnected` until [`DeviceSession::connect`] succeeds.
//! Every register operation checks the state first and fails with
//! [`Error::NotConnected`] without touching the transport.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ucache_core::{lookup_sensor, DeviceInfo, LogCounts, SensorDescriptor};

use crate::error::{Error, Result};
use crate::register::{self, registers, DecodeError, DecodeResult, Register};
use crate::transport::Transport;

/// Default time allowed for finding and connecting to a device
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// A session with one logger over one transport
pub struct DeviceSession<T: Transport> {
    address: String,
    transport: T,
    state: ConnectionState,
    device_info: Option<DeviceInfo>,
    connect_timeout: Duration,
}

impl<T: Transport> DeviceSession<T> {
    /// Create a disconnected session for the device at `address`
    pub fn new(address: impl Into<String>, transport: T) -> Self {
        Self {
            address: address.into(),
            transport,
            state: ConnectionState::Disconnected,
            device_info: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Device information cached by the last [`read_info`](Self::read_info)
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Open the link
    ///
    /// On failure the session stays `Disconnected`. Connecting an already
    /// connected session does nothing.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!(address = %self.address, "Already connected");
            return Ok(());
        }

        info!(address = %self.address, "Connecting to device");
        self.transport
            .connect(&self.address, self.connect_timeout)
            .await
            .map_err(|source| Error::Connection {
                address: self.address.clone(),
                source,
            })?;

        self.state = ConnectionState::Connected;
        info!(address = %self.address, "Connected");
        Ok(())
    }

    /// Close the link
    ///
    /// The session always ends up `Disconnected` and drops its cached device
    /// info, even when the transport reports a failure. Disconnecting a
    /// disconnected session does nothing.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let result = self.transport.disconnect().await;
        self.state = ConnectionState::Disconnected;
        self.device_info = None;

        match result {
            Ok(()) => {
                info!(address = %self.address, "Disconnected");
                Ok(())
            }
            Err(source) => {
                warn!(address = %self.address, error = %source, "Disconnect failed");
                Err(Error::Connection {
                    address: self.address.clone(),
                    source,
                })
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Read a register's raw bytes
    pub async fn read_register(&mut self, register: Register) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        register::read(&mut self.transport, register).await
    }

    /// Write raw bytes to a register
    pub async fn write_register(&mut self, register: Register, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        register::write(&mut self.transport, register, data).await
    }

    pub(crate) async fn read_decoded<V>(
        &mut self,
        register: Register,
        decode: impl FnOnce(&[u8]) -> DecodeResult<V>,
    ) -> Result<V> {
        self.ensure_connected()?;
        register::read_as(&mut self.transport, register, decode).await
    }

    pub(crate) async fn subscribe(&mut self, register: Register) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.ensure_connected()?;
        debug!(register = %register, "Subscribing");
        self.transport
            .subscribe(register.uuid)
            .await
            .map_err(|source| Error::Subscription { register, source })
    }

    pub(crate) async fn unsubscribe(&mut self, register: Register) -> Result<()> {
        self.ensure_connected()?;
        debug!(register = %register, "Unsubscribing");
        self.transport
            .unsubscribe(register.uuid)
            .await
            .map_err(|source| Error::Subscription { register, source })
    }

    /// Read the Device Information Service strings
    ///
    /// The result is cached on the session until it disconnects; later calls
    /// return the cached copy.
    pub async fn read_info(&mut self) -> Result<DeviceInfo> {
        self.ensure_connected()?;
        if let Some(info) = &self.device_info {
            return Ok(info.clone());
        }

        let info = DeviceInfo {
            manufacturer_name: self.read_info_string(registers::MANUFACTURER_NAME).await?,
            model_number: self.read_info_string(registers::MODEL_NUMBER).await?,
            serial_number: self.read_info_string(registers::SERIAL_NUMBER).await?,
            firmware_revision: self.read_info_string(registers::FIRMWARE_REVISION).await?,
            hardware_revision: self.read_info_string(registers::HARDWARE_REVISION).await?,
        };

        debug!(
            model = %info.model_number,
            serial = %info.serial_number,
            firmware = %info.firmware_revision,
            "Read device info"
        );
        self.device_info = Some(info.clone());
        Ok(info)
    }

    async fn read_info_string(&mut self, register: Register) -> Result<String> {
        let value = self.read_decoded(register, register::decode_string).await?;
        Ok(value
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string())
    }

    /// Battery level in percent
    pub async fn read_battery_level(&mut self) -> Result<u8> {
        self.read_decoded(registers::BATTERY_LEVEL, register::decode_u8)
            .await
    }

    /// Device clock as unix seconds
    pub async fn read_time(&mut self) -> Result<u32> {
        self.read_decoded(registers::TIME, register::decode_u32).await
    }

    /// The sensor installed on the logger
    pub async fn read_installed_sensor(&mut self) -> Result<&'static SensorDescriptor> {
        let id = self
            .read_decoded(registers::SENSOR, register::decode_u8)
            .await?;
        Ok(lookup_sensor(id)?)
    }

    /// Whether the logger is currently logging
    pub async fn read_logging_status(&mut self) -> Result<bool> {
        self.read_decoded(registers::LOGGING_STATUS, register::decode_bool)
            .await
    }

    pub async fn set_logging_status(&mut self, enabled: bool) -> Result<()> {
        info!(enabled, "Setting logging status");
        self.write_register(registers::LOGGING_STATUS, &register::encode_bool(enabled))
            .await
    }

    /// Unix time at which the log memory will be full, None while logging
    /// is disabled
    pub async fn read_log_full_time(&mut self) -> Result<Option<u32>> {
        let time = self
            .read_decoded(registers::LOG_FULL_TIME, register::decode_u32)
            .await?;
        Ok(nonzero(time))
    }

    /// Log buffer counters; the first is the number of entries available
    pub async fn read_nb_logs_available(&mut self) -> Result<LogCounts> {
        self.read_decoded(registers::NB_LOGS, decode_log_counts)
            .await
    }

    /// Timestamp of the last transferred entry, None when the log is empty
    pub async fn read_last_transferred_time(&mut self) -> Result<Option<u32>> {
        let time = self
            .read_decoded(registers::LAST_TRANSFER, register::decode_u32)
            .await?;
        Ok(nonzero(time))
    }

    /// Move the transfer pointer; entries after `timestamp` are sent by the
    /// next transfer, and 0 rewinds to the oldest entry
    pub async fn write_last_transferred_time(&mut self, timestamp: u32) -> Result<()> {
        info!(timestamp, "Setting last transferred time");
        self.write_register(registers::LAST_TRANSFER, &register::encode_u32(timestamp))
            .await
    }

    /// How often the logger advertises: 0 only on button press, n after
    /// every n-th log entry
    pub async fn set_advertising_frequency(&mut self, every_n_logs: u8) -> Result<()> {
        info!(every_n_logs, "Setting advertising frequency");
        self.write_register(registers::ADVERTISING, &register::encode_u8(every_n_logs))
            .await
    }

    pub async fn set_alias(&mut self, alias: &str) -> Result<()> {
        info!(alias = %alias, "Setting alias");
        self.write_register(registers::ALIAS, &register::encode_string(alias))
            .await
    }
}

fn nonzero(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

fn decode_log_counts(bytes: &[u8]) -> DecodeResult<LogCounts> {
    if bytes.len() != 12 {
        return Err(DecodeError::Length {
            expected: 12,
            actual: bytes.len(),
        });
    }
    let words = register::decode_u32_words(bytes)?;
    Ok(LogCounts([words[0], words[1], words[2]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockTransport};
    use crate::register::encode_u32;

    const ADDRESS: &str = "C4:64:E3:00:11:22";

    fn info_transport() -> MockTransport {
        MockTransport::new()
            .with_value(registers::MANUFACTURER_NAME, b"Apogee Instruments\0".to_vec())
            .with_value(registers::MODEL_NUMBER, b" uCache ".to_vec())
            .with_value(registers::SERIAL_NUMBER, b"1234".to_vec())
            .with_value(registers::FIRMWARE_REVISION, b"1.2".to_vec())
            .with_value(registers::HARDWARE_REVISION, b"B".to_vec())
    }

    async fn connected(transport: MockTransport) -> DeviceSession<MockTransport> {
        let mut session = DeviceSession::new(ADDRESS, transport);
        session.connect().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut session = DeviceSession::new(ADDRESS, info_transport());

        assert!(matches!(session.read_time().await, Err(Error::NotConnected)));
        assert!(matches!(session.read_info().await, Err(Error::NotConnected)));
        assert!(matches!(
            session.set_logging_status(true).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.read_register(registers::SENSOR).await,
            Err(Error::NotConnected)
        ));
        assert!(session.transport().calls.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_stays_disconnected() {
        let mut transport = MockTransport::new();
        transport.fail_connect = true;
        let mut session = DeviceSession::new(ADDRESS, transport);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let mut session = connected(MockTransport::new()).await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.transport().is_open());

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.transport().is_open());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut session = connected(MockTransport::new()).await;

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            session.transport().count(|c| *c == MockCall::Disconnect),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect_failure_still_disconnects() {
        let mut transport = MockTransport::new();
        transport.fail_disconnect = true;
        let mut session = connected(transport).await;

        let err = session.disconnect().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_info_is_cached_until_disconnect() {
        let mut session = connected(info_transport()).await;

        let info = session.read_info().await.unwrap();
        assert_eq!(info.manufacturer_name, "Apogee Instruments");
        assert_eq!(info.model_number, "uCache");
        assert_eq!(info.serial_number, "1234");
        assert_eq!(session.device_info(), Some(&info));

        let reads = session.transport().count(|c| matches!(c, MockCall::Read(_)));
        session.read_info().await.unwrap();
        assert_eq!(
            session.transport().count(|c| matches!(c, MockCall::Read(_))),
            reads
        );

        session.disconnect().await.unwrap();
        assert!(session.device_info().is_none());
    }

    #[tokio::test]
    async fn test_read_battery_and_time() {
        let transport = MockTransport::new()
            .with_value(registers::BATTERY_LEVEL, vec![87])
            .with_value(registers::TIME, encode_u32(1_700_000_000));
        let mut session = connected(transport).await;

        assert_eq!(session.read_battery_level().await.unwrap(), 87);
        assert_eq!(session.read_time().await.unwrap(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_short_time_register_is_malformed() {
        let transport = MockTransport::new().with_value(registers::TIME, vec![1, 2, 3]);
        let mut session = connected(transport).await;

        let err = session.read_time().await.unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedResponse {
                register: registers::TIME,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_read_installed_sensor() {
        let transport = MockTransport::new().with_value(registers::SENSOR, vec![4]);
        let mut session = connected(transport).await;

        let sensor = session.read_installed_sensor().await.unwrap();
        assert_eq!(sensor.name, Some("SQ-110"));
        assert_eq!(sensor.parameter_names, &["PPFD"]);
    }

    #[tokio::test]
    async fn test_read_unknown_sensor() {
        let transport = MockTransport::new().with_value(registers::SENSOR, vec![200]);
        let mut session = connected(transport).await;

        let err = session.read_installed_sensor().await.unwrap_err();
        assert!(matches!(err, Error::UnknownSensor(_)));
    }

    #[tokio::test]
    async fn test_read_nb_logs_available() {
        let mut counts = Vec::new();
        for v in [120u32, 3, 0] {
            counts.extend_from_slice(&encode_u32(v));
        }
        let transport = MockTransport::new().with_value(registers::NB_LOGS, counts);
        let mut session = connected(transport).await;

        let counts = session.read_nb_logs_available().await.unwrap();
        assert_eq!(counts.available(), 120);
        assert_eq!(counts, LogCounts([120, 3, 0]));
    }

    #[tokio::test]
    async fn test_zero_times_read_as_none() {
        let transport = MockTransport::new()
            .with_value(registers::LOG_FULL_TIME, encode_u32(0))
            .with_value(registers::LAST_TRANSFER, encode_u32(1_700_000_000));
        let mut session = connected(transport).await;

        assert_eq!(session.read_log_full_time().await.unwrap(), None);
        assert_eq!(
            session.read_last_transferred_time().await.unwrap(),
            Some(1_700_000_000)
        );
    }

    #[tokio::test]
    async fn test_writes_are_encoded() {
        let mut session = connected(MockTransport::new()).await;

        session.set_logging_status(true).await.unwrap();
        session.write_last_transferred_time(0).await.unwrap();
        session.set_advertising_frequency(3).await.unwrap();
        session.set_alias("roof").await.unwrap();

        let transport = session.transport();
        assert_eq!(transport.writes_to(registers::LOGGING_STATUS), vec![vec![1]]);
        assert_eq!(transport.writes_to(registers::LAST_TRANSFER), vec![vec![0, 0, 0, 0]]);
        assert_eq!(transport.writes_to(registers::ADVERTISING), vec![vec![3]]);
        assert_eq!(transport.writes_to(registers::ALIAS), vec![b"roof".to_vec()]);
    }

    #[tokio::test]
    async fn test_logging_status_round_trip() {
        let mut session = connected(MockTransport::new()).await;
        session.set_logging_status(false).await.unwrap();
        assert!(!session.read_logging_status().await.unwrap());
        session.set_logging_status(true).await.unwrap();
        assert!(session.read_logging_status().await.unwrap());
    }
}
