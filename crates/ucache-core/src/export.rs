//! Row formatting for exported log data
//!
//! Writers outside this crate append these rows to a file. A data file starts
//! with two header rows: `timestamp` followed by the sensor's parameter names,
//! then an empty cell followed by the units.

use chrono::{DateTime, TimeZone};
use std::fmt::Display;

use crate::device::LogRecord;
use crate::sensor::SensorDescriptor;

/// Timestamp format used in exported rows
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Header rows (parameter names, units) for a sensor's data file
pub fn data_header(sensor: &SensorDescriptor) -> [Vec<String>; 2] {
    let mut names = vec!["timestamp".to_string()];
    names.extend(sensor.parameter_names.iter().map(|s| s.to_string()));

    let mut units = vec![String::new()];
    units.extend(sensor.unit_strings.iter().map(|s| s.to_string()));

    [names, units]
}

/// Render a unix timestamp in `tz`
pub fn format_timestamp<Tz>(timestamp: u32, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    DateTime::from_timestamp(i64::from(timestamp), 0)
        .map(|dt| dt.with_timezone(tz).format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// One data row: the entry time rendered in `tz`, then the scaled values
///
/// Values always carry a decimal point (`5.0`, not `5`).
pub fn data_row<Tz>(record: &LogRecord, tz: &Tz) -> Vec<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut row = Vec::with_capacity(record.raw_values.len() + 1);
    row.push(format_timestamp(record.timestamp, tz));
    row.extend(record.values().iter().map(|v| format!("{v:?}")));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::lookup_sensor;
    use chrono::Utc;

    #[test]
    fn test_data_header() {
        let sensor = lookup_sensor(20).unwrap();
        let [names, units] = data_header(sensor);
        assert_eq!(names, vec!["timestamp", "Sin", "Sout"]);
        assert_eq!(units, vec!["", "W m-2", "W m-2"]);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0, &Utc), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_700_000_000, &Utc), "2023-11-14 22:13:20");
    }

    #[test]
    fn test_data_row_utc() {
        let record = LogRecord::new(1_700_000_000, vec![50000, -12345]);
        let row = data_row(&record, &Utc);
        assert_eq!(row, vec!["2023-11-14 22:13:20", "5.0", "-1.2345"]);

        let record = LogRecord::new(1_700_000_000, vec![0, 1, -10000]);
        assert_eq!(&data_row(&record, &Utc)[1..], ["0.0", "0.0001", "-1.0"]);
    }
}
