//! Device clock synchronization

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::register::{self, registers};
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Largest drift that is corrected (one year); anything above is taken to
/// mean the reference clock itself is wrong
pub const MAX_CORRECTABLE_DRIFT_S: u64 = 31_536_000;

/// What a time check did to the device clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncAction {
    /// Drift at or below tolerance, clock left alone
    WithinTolerance,
    /// Clock overwritten with the reference time
    Updated,
    /// Drift too large to trust, clock left alone
    OutOfRange,
    /// Correction attempted but the write failed
    WriteFailed,
}

/// Outcome of a time check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSync {
    /// Device clock before any correction, unix seconds
    pub device_time: u32,
    /// Absolute difference from the reference, in seconds
    pub drift: u64,
    pub action: TimeSyncAction,
}

impl<T: Transport> DeviceSession<T> {
    /// Compare the device clock against `reference` and correct it when the
    /// drift is above `tolerance_s` but below [`MAX_CORRECTABLE_DRIFT_S`]
    ///
    /// A failed correction is reported through [`TimeSyncAction::WriteFailed`]
    /// rather than as an error; only the initial clock read can fail.
    pub async fn check_and_update_time(
        &mut self,
        tolerance_s: u64,
        reference: DateTime<Utc>,
    ) -> Result<TimeSync> {
        let device_time = self.read_time().await?;
        let reference_s = reference.timestamp();
        let drift = (reference_s - i64::from(device_time)).unsigned_abs();

        let action = if drift <= tolerance_s {
            TimeSyncAction::WithinTolerance
        } else if drift >= MAX_CORRECTABLE_DRIFT_S {
            warn!(drift, device_time, "Clock drift beyond one year, not correcting");
            TimeSyncAction::OutOfRange
        } else {
            match u32::try_from(reference_s) {
                Ok(new_time) => match self
                    .write_register(registers::TIME, &register::encode_u32(new_time))
                    .await
                {
                    Ok(()) => {
                        info!(drift, new_time, "Device clock updated");
                        TimeSyncAction::Updated
                    }
                    Err(e) => {
                        warn!(drift, error = %e, "Failed to update device clock");
                        TimeSyncAction::WriteFailed
                    }
                },
                Err(_) => {
                    warn!(reference = reference_s, "Reference time does not fit the device clock");
                    TimeSyncAction::OutOfRange
                }
            }
        };

        Ok(TimeSync {
            device_time,
            drift,
            action,
        })
    }

    /// [`check_and_update_time`](Self::check_and_update_time) against the
    /// host clock
    pub async fn sync_time(&mut self, tolerance_s: u64) -> Result<TimeSync> {
        self.check_and_update_time(tolerance_s, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mock::MockTransport;
    use crate::register::encode_u32;

    const NOW: i64 = 1_700_000_000;

    fn reference() -> DateTime<Utc> {
        DateTime::from_timestamp(NOW, 0).unwrap()
    }

    async fn session_with_clock(device_time: u32) -> DeviceSession<MockTransport> {
        let transport = MockTransport::new().with_value(registers::TIME, encode_u32(device_time));
        let mut session = DeviceSession::new("AA:BB:CC:DD:EE:FF", transport);
        session.connect().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_drift_within_tolerance_is_not_written() {
        let mut session = session_with_clock((NOW - 1) as u32).await;

        let sync = session.check_and_update_time(2, reference()).await.unwrap();
        assert_eq!(sync.drift, 1);
        assert_eq!(sync.action, TimeSyncAction::WithinTolerance);
        assert!(session.transport().writes_to(registers::TIME).is_empty());
    }

    #[tokio::test]
    async fn test_drift_beyond_a_year_is_not_written() {
        let mut session = session_with_clock((NOW - 40_000_000) as u32).await;

        let sync = session.check_and_update_time(2, reference()).await.unwrap();
        assert_eq!(sync.drift, 40_000_000);
        assert_eq!(sync.action, TimeSyncAction::OutOfRange);
        assert!(session.transport().writes_to(registers::TIME).is_empty());
    }

    #[tokio::test]
    async fn test_moderate_drift_is_corrected() {
        let mut session = session_with_clock((NOW + 100) as u32).await;

        let sync = session.check_and_update_time(2, reference()).await.unwrap();
        assert_eq!(sync.drift, 100);
        assert_eq!(sync.action, TimeSyncAction::Updated);
        assert_eq!(
            session.transport().writes_to(registers::TIME),
            vec![encode_u32(NOW as u32).to_vec()]
        );
    }

    #[tokio::test]
    async fn test_failed_write_still_reports_drift() {
        let transport = MockTransport::new()
            .with_value(registers::TIME, encode_u32((NOW - 100) as u32))
            .failing_write(registers::TIME);
        let mut session = DeviceSession::new("AA:BB:CC:DD:EE:FF", transport);
        session.connect().await.unwrap();

        let sync = session.check_and_update_time(2, reference()).await.unwrap();
        assert_eq!(sync.drift, 100);
        assert_eq!(sync.action, TimeSyncAction::WriteFailed);
    }

    #[tokio::test]
    async fn test_time_check_requires_connection() {
        let transport = MockTransport::new().with_value(registers::TIME, encode_u32(0));
        let mut session = DeviceSession::new("AA:BB:CC:DD:EE:FF", transport);

        let err = session.check_and_update_time(2, reference()).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
