//! Log transfer engine
//!
//! Once notifications on the data register are enabled, the logger pushes one
//! frame per stored entry, oldest first:
//!
//! ```text
//! | timestamp: u32 LE | value 0: i32 LE | value 1: i32 LE | ...
//! ```
//!
//! The stream carries no length; it ends with a frame of exactly four `0xFF`
//! bytes. The entry count read beforehand only drives progress reporting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use ucache_core::LogRecord;

use crate::error::{Error, Result};
use crate::register::{registers, DecodeError, DecodeResult};
use crate::session::DeviceSession;
use crate::transport::Transport;

/// End-of-transfer marker
pub const SENTINEL: [u8; 4] = [0xff; 4];

/// How long to wait for the next frame before giving up
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

const TIMESTAMP_LEN: usize = 4;
const VALUE_LEN: usize = 4;

/// Accumulator for one transfer
///
/// Frames are kept raw, in arrival order, and decoded once the stream ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferState {
    /// Entries the device reported before the transfer started
    pub expected_count: u32,
    /// Raw frames received so far, sentinel excluded
    pub received: Vec<Vec<u8>>,
    /// Whether the sentinel arrived
    pub completed: bool,
}

impl TransferState {
    pub fn reset(&mut self, expected_count: u32) {
        self.expected_count = expected_count;
        self.received.clear();
        self.completed = false;
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            received: self.received.len(),
            expected: self.expected_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub received: usize,
    pub expected: u32,
}

impl TransferProgress {
    /// Share of the expected entries received, in percent
    ///
    /// None when the device reported no entries. May exceed 100 when the
    /// device sends more than it announced.
    pub fn percent(&self) -> Option<f64> {
        (self.expected > 0).then(|| self.received as f64 * 100.0 / f64::from(self.expected))
    }
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

#[derive(Clone)]
pub struct TransferOptions {
    /// Maximum wait between two frames
    pub idle_timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            progress: None,
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("idle_timeout", &self.idle_timeout)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Call `callback` after every received frame
    pub fn with_progress(
        mut self,
        callback: impl Fn(TransferProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }
}

/// Why the frame stream stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEnd {
    /// End-of-transfer marker received
    Sentinel,
    /// No frame within the idle timeout
    IdleTimeout,
    /// Notification channel closed, usually because the link went down
    LinkClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    /// Entries the device reported before the transfer
    pub expected: u32,
    /// Decoded entries, oldest first
    pub records: Vec<LogRecord>,
    pub end: TransferEnd,
}

impl TransferReport {
    /// Whether the device signalled the end of its log
    pub fn is_complete(&self) -> bool {
        self.end == TransferEnd::Sentinel
    }
}

pub fn is_sentinel(frame: &[u8]) -> bool {
    frame == SENTINEL
}

/// Decode one data frame into a log record
pub fn decode_frame(frame: &[u8]) -> DecodeResult<LogRecord> {
    if frame.len() < TIMESTAMP_LEN {
        return Err(DecodeError::Length {
            expected: TIMESTAMP_LEN,
            actual: frame.len(),
        });
    }
    let (timestamp, values) = frame.split_at(TIMESTAMP_LEN);
    if values.len() % VALUE_LEN != 0 {
        return Err(DecodeError::Misaligned(frame.len()));
    }

    let timestamp = u32::from_le_bytes([timestamp[0], timestamp[1], timestamp[2], timestamp[3]]);
    let raw_values = values
        .chunks_exact(VALUE_LEN)
        .map(|v| i32::from_le_bytes([v[0], v[1], v[2], v[3]]))
        .collect();

    Ok(LogRecord::new(timestamp, raw_values))
}

/// One log download, borrowing the session for its whole duration
pub struct LogTransfer<'a, T: Transport> {
    session: &'a mut DeviceSession<T>,
    options: TransferOptions,
    state: TransferState,
}

impl<'a, T: Transport> LogTransfer<'a, T> {
    pub fn new(session: &'a mut DeviceSession<T>, options: TransferOptions) -> Self {
        Self {
            session,
            options,
            state: TransferState::default(),
        }
    }

    /// Frames accumulated by the last run, also after a failed one
    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Drain the device's log
    ///
    /// Subscribes once, collects frames until the sentinel, an idle timeout,
    /// or a closed channel, then unsubscribes and decodes everything. A
    /// timeout or closed channel is not an error; the report says how the
    /// stream ended. Any malformed frame fails the whole transfer.
    pub async fn run(&mut self) -> Result<TransferReport> {
        self.state.reset(0);
        let counts = self.session.read_nb_logs_available().await?;
        self.state.reset(counts.available());
        info!(expected = self.state.expected_count, "Starting log transfer");

        let mut frames = match self.session.subscribe(registers::DATA).await {
            Ok(frames) => frames,
            Err(e) => {
                self.release().await;
                return Err(e);
            }
        };

        let end = loop {
            match timeout(self.options.idle_timeout, frames.recv()).await {
                Ok(Some(frame)) if is_sentinel(&frame) => {
                    self.state.completed = true;
                    break TransferEnd::Sentinel;
                }
                Ok(Some(frame)) => {
                    trace!(len = frame.len(), "Data frame");
                    self.state.received.push(frame);
                    if let Some(callback) = &self.options.progress {
                        callback(self.state.progress());
                    }
                }
                Ok(None) => {
                    warn!(received = self.state.received.len(), "Notification channel closed");
                    break TransferEnd::LinkClosed;
                }
                Err(_) => {
                    warn!(
                        received = self.state.received.len(),
                        timeout = ?self.options.idle_timeout,
                        "No data before idle timeout"
                    );
                    break TransferEnd::IdleTimeout;
                }
            }
        };
        drop(frames);
        self.release().await;

        let records = self
            .state
            .received
            .iter()
            .map(|frame| decode_frame(frame))
            .collect::<DecodeResult<Vec<_>>>()
            .map_err(|source| Error::MalformedResponse {
                register: registers::DATA,
                source,
            })?;

        info!(records = records.len(), end = ?end, "Log transfer finished");
        Ok(TransferReport {
            expected: self.state.expected_count,
            records,
            end,
        })
    }

    async fn release(&mut self) {
        if let Err(e) = self.session.unsubscribe(registers::DATA).await {
            debug!(error = %e, "Ignoring unsubscribe failure");
        }
    }
}

impl<T: Transport> DeviceSession<T> {
    /// Download all untransferred log entries
    pub async fn transfer_data(&mut self, options: TransferOptions) -> Result<TransferReport> {
        LogTransfer::new(self, options).run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockTransport};
    use crate::register::encode_u32;
    use std::sync::Mutex;

    fn frame(timestamp: u32, values: &[i32]) -> Vec<u8> {
        let mut bytes = timestamp.to_le_bytes().to_vec();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    fn nb_logs(available: u32) -> Vec<u8> {
        let mut bytes = encode_u32(available).to_vec();
        bytes.extend_from_slice(&[0; 8]);
        bytes
    }

    fn quick() -> TransferOptions {
        TransferOptions::new().with_idle_timeout(Duration::from_millis(50))
    }

    async fn session_with_frames(
        available: u32,
        frames: Vec<Vec<u8>>,
    ) -> DeviceSession<MockTransport> {
        let transport = MockTransport::new()
            .with_value(registers::NB_LOGS, nb_logs(available))
            .with_frames(registers::DATA, frames);
        let mut session = DeviceSession::new("AA:BB:CC:DD:EE:FF", transport);
        session.connect().await.unwrap();
        session
    }

    #[test]
    fn test_decode_frame() {
        let record = decode_frame(&frame(100, &[50000, -12345])).unwrap();
        assert_eq!(record.timestamp, 100);
        assert_eq!(record.values(), vec![5.0, -1.2345]);
    }

    #[test]
    fn test_decode_frame_without_values() {
        let record = decode_frame(&frame(100, &[])).unwrap();
        assert!(record.raw_values.is_empty());
    }

    #[test]
    fn test_decode_frame_bad_lengths() {
        assert_eq!(decode_frame(&[1, 2, 3, 4, 5]), Err(DecodeError::Misaligned(5)));
        assert_eq!(
            decode_frame(&[1, 2]),
            Err(DecodeError::Length {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_sentinel() {
        assert!(is_sentinel(&[0xff, 0xff, 0xff, 0xff]));
        assert!(!is_sentinel(&[0xff, 0xff, 0xff]));
        assert!(!is_sentinel(&frame(u32::MAX, &[0])));
    }

    #[test]
    fn test_progress_percent() {
        let progress = TransferProgress {
            received: 5,
            expected: 20,
        };
        assert_eq!(progress.percent(), Some(25.0));
        let progress = TransferProgress {
            received: 5,
            expected: 0,
        };
        assert_eq!(progress.percent(), None);
    }

    #[tokio::test]
    async fn test_transfer_until_sentinel() {
        let mut session = session_with_frames(
            2,
            vec![frame(100, &[50000]), frame(200, &[-50000]), SENTINEL.to_vec()],
        )
        .await;

        let report = session.transfer_data(quick()).await.unwrap();
        assert_eq!(report.end, TransferEnd::Sentinel);
        assert!(report.is_complete());
        assert_eq!(report.expected, 2);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].timestamp, 100);
        assert_eq!(report.records[0].values(), vec![5.0]);
        assert_eq!(report.records[1].timestamp, 200);
        assert_eq!(report.records[1].values(), vec![-5.0]);
    }

    #[tokio::test]
    async fn test_subscribes_once_and_unsubscribes_once() {
        let mut session = session_with_frames(
            3,
            vec![frame(1, &[1]), frame(2, &[2]), frame(3, &[3]), SENTINEL.to_vec()],
        )
        .await;

        session.transfer_data(quick()).await.unwrap();
        let data = registers::DATA.uuid;
        let transport = session.transport();
        assert_eq!(transport.count(|c| *c == MockCall::Subscribe(data)), 1);
        assert_eq!(transport.count(|c| *c == MockCall::Unsubscribe(data)), 1);
    }

    #[tokio::test]
    async fn test_frames_after_sentinel_are_ignored() {
        let mut session = session_with_frames(
            1,
            vec![frame(100, &[1]), SENTINEL.to_vec(), frame(200, &[2])],
        )
        .await;

        let report = session.transfer_data(quick()).await.unwrap();
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test]
    async fn test_expected_count_is_not_a_cutoff() {
        let mut session = session_with_frames(
            1,
            vec![frame(1, &[1]), frame(2, &[2]), frame(3, &[3]), SENTINEL.to_vec()],
        )
        .await;

        let report = session.transfer_data(quick()).await.unwrap();
        assert_eq!(report.expected, 1);
        assert_eq!(report.records.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_frame_fails_whole_transfer() {
        let mut session = session_with_frames(
            2,
            vec![frame(100, &[1]), vec![1, 2, 3, 4, 5], SENTINEL.to_vec()],
        )
        .await;

        let mut transfer = LogTransfer::new(&mut session, quick());
        let err = transfer.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedResponse {
                register: registers::DATA,
                source: DecodeError::Misaligned(5),
            }
        ));
        assert_eq!(transfer.state().received.len(), 2);
        assert!(transfer.state().completed);
    }

    #[tokio::test]
    async fn test_idle_timeout_keeps_partial_data() {
        let mut session = session_with_frames(3, vec![frame(100, &[1]), frame(200, &[2])]).await;

        let report = session.transfer_data(quick()).await.unwrap();
        assert_eq!(report.end, TransferEnd::IdleTimeout);
        assert_eq!(report.records.len(), 2);
        assert_eq!(
            session
                .transport()
                .count(|c| *c == MockCall::Unsubscribe(registers::DATA.uuid)),
            1
        );
    }

    #[tokio::test]
    async fn test_idle_timeout_without_data() {
        let mut session = session_with_frames(0, Vec::new()).await;

        let report = session.transfer_data(quick()).await.unwrap();
        assert_eq!(report.end, TransferEnd::IdleTimeout);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_stops_transfer() {
        let mut transport = MockTransport::new()
            .with_value(registers::NB_LOGS, nb_logs(5))
            .with_frames(registers::DATA, vec![frame(100, &[1])]);
        transport.hang_up_after_frames = true;
        let mut session = DeviceSession::new("AA:BB:CC:DD:EE:FF", transport);
        session.connect().await.unwrap();

        let mut transfer = LogTransfer::new(&mut session, TransferOptions::new());
        let report = transfer.run().await.unwrap();
        assert_eq!(report.end, TransferEnd::LinkClosed);
        assert_eq!(report.records.len(), 1);
        assert!(!transfer.state().completed);
    }

    #[tokio::test]
    async fn test_subscription_failure() {
        let mut transport = MockTransport::new().with_value(registers::NB_LOGS, nb_logs(5));
        transport.fail_subscribe = true;
        transport.fail_unsubscribe = true;
        let mut session = DeviceSession::new("AA:BB:CC:DD:EE:FF", transport);
        session.connect().await.unwrap();

        let err = session.transfer_data(quick()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Subscription {
                register: registers::DATA,
                ..
            }
        ));
        assert_eq!(
            session
                .transport()
                .count(|c| *c == MockCall::Unsubscribe(registers::DATA.uuid)),
            1
        );
    }

    #[tokio::test]
    async fn test_progress_callback() {
        let mut session = session_with_frames(
            2,
            vec![frame(100, &[1]), frame(200, &[2]), SENTINEL.to_vec()],
        )
        .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = quick().with_progress(move |p| sink.lock().unwrap().push(p.percent()));

        session.transfer_data(options).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(50.0), Some(100.0)]);
    }

    #[tokio::test]
    async fn test_transfer_requires_connection() {
        let transport = MockTransport::new().with_value(registers::NB_LOGS, nb_logs(1));
        let mut session = DeviceSession::new("AA:BB:CC:DD:EE:FF", transport);

        let err = session.transfer_data(quick()).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(session.transport().calls.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_transfers_do_not_share_state() {
        let mut session =
            session_with_frames(1, vec![frame(100, &[1]), SENTINEL.to_vec()]).await;

        let first = session.transfer_data(quick()).await.unwrap();
        let second = session.transfer_data(quick()).await.unwrap();
        assert_eq!(first.records, second.records);
        assert_eq!(second.records.len(), 1);
    }
}
