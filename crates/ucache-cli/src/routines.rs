//! Connect-operate-disconnect routines behind the CLI commands
//!
//! Every routine connects its session, runs its steps, and disconnects, also
//! when a step fails. A disconnect failure after a failed step is logged and
//! the step's error is returned.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use ucache_core::{DeviceInfo, LoggingSettings, SensorDescriptor};
use ucache_gatt::{DeviceSession, TimeSync, TransferOptions, TransferReport, Transport};

use crate::config::LoggingConfig;
use crate::export::{append_data, append_log, LogEntry, LogEvent};

/// Accepted format for a transfer start time
pub const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Where the next download starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStart {
    /// Rewind to the oldest stored entry
    All,
    /// Entries after this unix time
    Since(u32),
}

impl TransferStart {
    /// Value for the last-transferred pointer
    pub fn pointer(&self) -> u32 {
        match self {
            TransferStart::All => 0,
            TransferStart::Since(t) => *t,
        }
    }
}

impl FromStr for TransferStart {
    type Err = anyhow::Error;

    /// `all`, or a local time as `YYYY-MM-DD HH:MM`
    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(TransferStart::All);
        }
        let naive = NaiveDateTime::parse_from_str(s, START_TIME_FORMAT)
            .with_context(|| format!("Expected \"all\" or \"YYYY-MM-DD HH:MM\", got \"{s}\""))?;
        let local = Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| anyhow!("{s} does not exist in the local time zone"))?;
        let timestamp = u32::try_from(local.timestamp())
            .map_err(|_| anyhow!("{s} is outside the device clock range"))?;
        Ok(TransferStart::Since(timestamp))
    }
}

/// Close the session after a routine body, keeping the body's error if any
async fn finish<T: Transport, R>(session: &mut DeviceSession<T>, result: Result<R>) -> Result<R> {
    let disconnected = session.disconnect().await;
    match (result, disconnected) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(value), Err(e)) => {
            warn!(error = %e, "Routine finished but disconnect failed");
            Ok(value)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(secondary)) => {
            warn!(error = %secondary, "Disconnect after failure also failed");
            Err(e)
        }
    }
}

/// Snapshot of a logger's identity and state
#[derive(Debug, Clone)]
pub struct Status {
    pub info: DeviceInfo,
    pub battery_level: u8,
    pub device_time: u32,
}

async fn read_status<T: Transport>(session: &mut DeviceSession<T>) -> Result<Status> {
    let info = session.read_info().await?;
    let battery_level = session.read_battery_level().await?;
    let device_time = session.read_time().await?;
    info!(
        device = %info.device_type(),
        serial = %info.serial_number,
        battery_level,
        device_time,
        "Device status"
    );
    Ok(Status {
        info,
        battery_level,
        device_time,
    })
}

#[derive(Debug, Clone)]
pub struct InfoReport {
    pub status: Status,
    pub sensor: &'static SensorDescriptor,
}

/// Read device information, battery, clock and installed sensor
pub async fn info<T: Transport>(session: &mut DeviceSession<T>) -> Result<InfoReport> {
    session.connect().await?;
    let result = info_steps(session).await;
    finish(session, result).await
}

async fn info_steps<T: Transport>(session: &mut DeviceSession<T>) -> Result<InfoReport> {
    let status = read_status(session).await?;
    let sensor = session.read_installed_sensor().await?;
    Ok(InfoReport { status, sensor })
}

#[derive(Debug, Clone)]
pub struct SetupReport {
    pub status: Status,
    /// Settings as written, after normalization
    pub settings: LoggingSettings,
    pub advertising_freq: u8,
    pub memory_full_time: Option<u32>,
}

/// Configure logging and start it, then record the event in `log_file`
pub async fn setup<T: Transport>(
    session: &mut DeviceSession<T>,
    logging: &LoggingConfig,
    log_file: &Path,
) -> Result<SetupReport> {
    session.connect().await?;
    let result = setup_steps(session, logging).await;
    let report = finish(session, result).await?;

    append_log(
        log_file,
        &LogEntry {
            device_time: report.status.device_time,
            model: report.status.info.model_number.clone(),
            serial: report.status.info.serial_number.clone(),
            battery_level: report.status.battery_level,
            memory_full_time: report.memory_full_time,
            event: LogEvent::Setup {
                sampling_interval_s: report.settings.sampling_interval_s,
                logging_interval_s: report.settings.logging_interval_s,
                advertising_freq: report.advertising_freq,
            },
        },
    )?;
    Ok(report)
}

async fn setup_steps<T: Transport>(
    session: &mut DeviceSession<T>,
    logging: &LoggingConfig,
) -> Result<SetupReport> {
    let status = read_status(session).await?;
    let settings = session
        .set_logging_settings(logging.sampling_interval_secs, logging.logging_interval_secs, None)
        .await?;
    session
        .set_advertising_frequency(logging.advertising_freq)
        .await?;
    session.set_logging_status(true).await?;
    let memory_full_time = session.read_log_full_time().await?;
    Ok(SetupReport {
        status,
        settings,
        advertising_freq: logging.advertising_freq,
        memory_full_time,
    })
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub start: Option<TransferStart>,
    /// Skip the download below this many entries
    pub min_logs: u32,
    pub tolerance_s: u64,
    pub transfer: TransferOptions,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub status: Status,
    pub sensor: &'static SensorDescriptor,
    pub last_transferred: Option<u32>,
    pub transfer: TransferReport,
    /// `None` when the clock could not be checked after the transfer
    pub time_sync: Option<TimeSync>,
    pub memory_full_time: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// Logging is off, nothing to download
    NotLogging(Status),
    /// Fewer entries than the configured minimum
    TooFewLogs { status: Status, available: u32 },
    Downloaded(Box<DownloadReport>),
}

/// Download new entries, correct the clock, and append to the data and log
/// files
pub async fn download<T: Transport>(
    session: &mut DeviceSession<T>,
    options: &DownloadOptions,
    data_file: &Path,
    log_file: &Path,
) -> Result<DownloadOutcome> {
    session.connect().await?;
    let result = download_steps(session, options).await;
    let outcome = finish(session, result).await?;

    if let DownloadOutcome::Downloaded(report) = &outcome {
        if !report.transfer.records.is_empty() {
            append_data(data_file, report.sensor, &report.transfer.records)?;
            info!(
                records = report.transfer.records.len(),
                path = %data_file.display(),
                "Data written"
            );
        }
        append_log(
            log_file,
            &LogEntry {
                device_time: report.status.device_time,
                model: report.status.info.model_number.clone(),
                serial: report.status.info.serial_number.clone(),
                battery_level: report.status.battery_level,
                memory_full_time: report.memory_full_time,
                event: LogEvent::DataTransfer {
                    time_difference_s: report.time_sync.as_ref().map(|s| s.drift),
                },
            },
        )?;
    }
    Ok(outcome)
}

async fn download_steps<T: Transport>(
    session: &mut DeviceSession<T>,
    options: &DownloadOptions,
) -> Result<DownloadOutcome> {
    let status = read_status(session).await?;

    if !session.read_logging_status().await? {
        info!("Logging is disabled, nothing to download");
        return Ok(DownloadOutcome::NotLogging(status));
    }

    if let Some(start) = options.start {
        session.write_last_transferred_time(start.pointer()).await?;
    }

    let available = session.read_nb_logs_available().await?.available();
    let last_transferred = session.read_last_transferred_time().await?;
    info!(available, last_transferred = ?last_transferred, "Log buffer");
    if available < options.min_logs {
        info!(available, min_logs = options.min_logs, "Too few entries, skipping download");
        return Ok(DownloadOutcome::TooFewLogs { status, available });
    }

    let sensor = session.read_installed_sensor().await?;
    let transfer = session.transfer_data(options.transfer.clone()).await?;

    // The device pointer has moved; keep the records whatever fails below
    let time_sync = match session.sync_time(options.tolerance_s).await {
        Ok(sync) => Some(sync),
        Err(e) => {
            warn!(error = %e, "Time check after transfer failed");
            None
        }
    };
    let memory_full_time = match session.read_log_full_time().await {
        Ok(time) => time,
        Err(e) => {
            warn!(error = %e, "Reading memory full time after transfer failed");
            None
        }
    };

    Ok(DownloadOutcome::Downloaded(Box::new(DownloadReport {
        status,
        sensor,
        last_transferred,
        transfer,
        time_sync,
        memory_full_time,
    })))
}

/// Correct the device clock against the host clock
pub async fn sync_time<T: Transport>(
    session: &mut DeviceSession<T>,
    tolerance_s: u64,
) -> Result<TimeSync> {
    session.connect().await?;
    let result = session.sync_time(tolerance_s).await.map_err(Into::into);
    finish(session, result).await
}
