//! InfluxDB line protocol encoding.
//!
//! ```text
//! measurement field=value timestamp_ns
//! ```
//!
//! Only float fields are produced. Tags are never emitted; series identity
//! is the `(measurement, field)` pair.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{Point, StoreError};

/// Encode a point as one line of line protocol (no trailing newline).
pub fn encode(point: &Point) -> Result<String, StoreError> {
    let value = point.value();
    if !value.is_finite() {
        return Err(StoreError::Encode(format!(
            "{}.{} has non-finite value {value}",
            point.measurement(),
            point.field()
        )));
    }

    let ts_ns = timestamp_ns(point.timestamp())?;

    let mut line = escape_measurement(point.measurement());
    line.push(' ');
    line.push_str(&escape_key(point.field()));
    line.push('=');
    line.push_str(&format_float(value));
    line.push(' ');
    line.push_str(&ts_ns.to_string());

    Ok(line)
}

/// Nanoseconds since the Unix epoch.
pub fn timestamp_ns(t: SystemTime) -> Result<u128, StoreError> {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .map_err(|_| StoreError::Encode("timestamp before unix epoch".to_string()))
}

fn format_float(v: f64) -> String {
    // Rust prints `-0` for negative zero, which influx rejects as a float.
    if v == 0.0 {
        return "0".to_string();
    }
    format!("{v}")
}

/// Spaces and commas must be escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

/// Commas, equals signs and spaces must be escaped in field keys.
fn escape_key(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
