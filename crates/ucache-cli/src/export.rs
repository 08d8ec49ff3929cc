//! CSV files for downloaded data and device events
//!
//! Both files are only ever appended to. Header rows are written when the
//! file is created.

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

use ucache_core::{data_header, data_row, format_timestamp, LogRecord, SensorDescriptor};

/// Columns of the event log file
pub const LOG_HEADER: [&str; 10] = [
    "timestamp",
    "model",
    "serial",
    "battery_level",
    "memory_full_time",
    "type",
    "sampling_interval",
    "logging_interval",
    "advertising_freq",
    "time_difference",
];

/// What happened to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Setup {
        sampling_interval_s: u32,
        logging_interval_s: u32,
        advertising_freq: u8,
    },
    DataTransfer {
        /// Clock drift found after the transfer, if the clock could be read
        time_difference_s: Option<u64>,
    },
}

/// One row of the event log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Device clock when the routine read it
    pub device_time: u32,
    pub model: String,
    pub serial: String,
    pub battery_level: u8,
    pub memory_full_time: Option<u32>,
    pub event: LogEvent,
}

impl LogEntry {
    pub fn to_row<Tz>(&self, tz: &Tz) -> Vec<String>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut row = vec![
            format_timestamp(self.device_time, tz),
            self.model.clone(),
            self.serial.clone(),
            self.battery_level.to_string(),
            self.memory_full_time
                .map(|t| format_timestamp(t, tz))
                .unwrap_or_default(),
        ];
        match &self.event {
            LogEvent::Setup {
                sampling_interval_s,
                logging_interval_s,
                advertising_freq,
            } => row.extend([
                "setup".to_string(),
                sampling_interval_s.to_string(),
                logging_interval_s.to_string(),
                advertising_freq.to_string(),
                String::new(),
            ]),
            LogEvent::DataTransfer { time_difference_s } => row.extend([
                "data transfer".to_string(),
                String::new(),
                String::new(),
                String::new(),
                time_difference_s.map(|d| d.to_string()).unwrap_or_default(),
            ]),
        }
        row
    }
}

fn escape_field(field: &str) -> String {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn write_row<W: Write>(out: &mut W, row: &[String]) -> std::io::Result<()> {
    let line: Vec<String> = row.iter().map(|f| escape_field(f)).collect();
    writeln!(out, "{}", line.join(","))
}

/// Append `rows` to a CSV file, preceded by `header` if the file is new
pub fn append_rows(path: &Path, header: &[Vec<String>], rows: &[Vec<String>]) -> Result<()> {
    let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = BufWriter::new(file);

    if is_new {
        for row in header {
            write_row(&mut out, row)?;
        }
    }
    for row in rows {
        write_row(&mut out, row)?;
    }
    out.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Append downloaded records, in local time
pub fn append_data(path: &Path, sensor: &SensorDescriptor, records: &[LogRecord]) -> Result<()> {
    append_data_in(path, sensor, records, &Local)
}

fn append_data_in<Tz>(
    path: &Path,
    sensor: &SensorDescriptor,
    records: &[LogRecord],
    tz: &Tz,
) -> Result<()>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let rows: Vec<Vec<String>> = records.iter().map(|r| data_row(r, tz)).collect();
    append_rows(path, &data_header(sensor), &rows)
}

/// Append an event to the log file, in local time
pub fn append_log(path: &Path, entry: &LogEntry) -> Result<()> {
    append_log_in(path, entry, &Local)
}

fn append_log_in<Tz>(path: &Path, entry: &LogEntry, tz: &Tz) -> Result<()>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let header: Vec<Vec<String>> = vec![LOG_HEADER.iter().map(|s| s.to_string()).collect()];
    append_rows(path, &header, &[entry.to_row(tz)])
}
