//! Logging and live-measurement configuration

use tracing::{info, warn};

use ucache_core::LoggingSettings;

use crate::error::Result;
use crate::register::{self, registers, DecodeError, DecodeResult};
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Resolution of the live averaging interval, in seconds
pub const LIVE_UNIT_S: f64 = 0.25;

/// Largest live averaging interval, in units of [`LIVE_UNIT_S`]
pub const MAX_LIVE_UNITS: u8 = 127;

/// Make a (sampling, logging) interval pair acceptable to the logger
///
/// The logging interval must be at least the sampling interval and a whole
/// multiple of it. A too-short logging interval pulls the sampling interval
/// down to match; otherwise the logging interval is floored to the nearest
/// multiple. Zero intervals are raised to one second first.
pub fn normalize_intervals(sampling_s: u32, logging_s: u32) -> (u32, u32) {
    let mut sampling = sampling_s.max(1);
    let mut logging = logging_s.max(1);

    if logging < sampling {
        sampling = logging;
    }
    logging -= logging % sampling;

    (sampling, logging)
}

/// Quantize a live averaging time to the device's 0.25 s steps
///
/// Returns the byte to write and the interval it actually represents.
pub fn quantize_live_average(avg_s: f64) -> (u8, f64) {
    let units = (avg_s / LIVE_UNIT_S).clamp(0.0, f64::from(MAX_LIVE_UNITS)) as u8;
    (units, f64::from(units) * LIVE_UNIT_S)
}

fn encode_logging_settings(settings: &LoggingSettings) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(&register::encode_u32(settings.sampling_interval_s));
    bytes.extend_from_slice(&register::encode_u32(settings.logging_interval_s));
    if let Some(start) = settings.start_time {
        bytes.extend_from_slice(&register::encode_u32(start));
    }
    bytes
}

fn decode_logging_settings(bytes: &[u8]) -> DecodeResult<LoggingSettings> {
    if bytes.len() != 8 && bytes.len() != 12 {
        return Err(DecodeError::LengthOneOf {
            expected: &[8, 12],
            actual: bytes.len(),
        });
    }
    let words = register::decode_u32_words(bytes)?;
    let mut settings = LoggingSettings::new(words[0], words[1]);
    if let Some(&start) = words.get(2).filter(|&&s| s != 0) {
        settings = settings.with_start_time(start);
    }
    Ok(settings)
}

impl<T: Transport> DeviceSession<T> {
    /// Write the sampling and logging intervals in one register write
    ///
    /// The intervals are normalized with [`normalize_intervals`] first; the
    /// returned settings are what was written.
    pub async fn set_logging_settings(
        &mut self,
        sampling_interval_s: u32,
        logging_interval_s: u32,
        start_time: Option<u32>,
    ) -> Result<LoggingSettings> {
        let (sampling, logging) = normalize_intervals(sampling_interval_s, logging_interval_s);
        if (sampling, logging) != (sampling_interval_s, logging_interval_s) {
            warn!(
                requested_sampling = sampling_interval_s,
                requested_logging = logging_interval_s,
                sampling,
                logging,
                "Adjusted logging intervals"
            );
        }

        let mut settings = LoggingSettings::new(sampling, logging);
        if let Some(start) = start_time {
            settings = settings.with_start_time(start);
        }

        info!(sampling, logging, start_time = ?start_time, "Writing logging settings");
        self.write_register(registers::LOGGING_SETTINGS, &encode_logging_settings(&settings))
            .await?;
        Ok(settings)
    }

    pub async fn read_logging_settings(&mut self) -> Result<LoggingSettings> {
        self.read_decoded(registers::LOGGING_SETTINGS, decode_logging_settings)
            .await
    }

    /// Set the averaging time of live measurements
    ///
    /// Returns the applied interval in seconds, which differs from the
    /// request when it is not a multiple of 0.25 s or exceeds 31.75 s.
    pub async fn set_live_settings(&mut self, avg_time_s: f64) -> Result<f64> {
        let (units, applied) = quantize_live_average(avg_time_s);
        info!(requested = avg_time_s, applied, "Writing live settings");
        self.write_register(registers::LIVE_SETTINGS, &register::encode_u8(units))
            .await?;
        Ok(applied)
    }
}
