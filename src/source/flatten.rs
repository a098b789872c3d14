//! JSON document flattening for poll sources.

use std::time::Duration;

use serde_json::Value;

use super::Observation;
use crate::bridge::state::SeriesKey;
use crate::config::LatencyUnit;

/// Poll waits are rounded up to this step.
const POLL_STEP_SECS: u64 = 5;

/// Turn every numeric leaf of `doc` into an observation.
///
/// The leaf's immediate parent key is the measurement and the leaf key is
/// the field, so `{"inverter": {"temp": 41}}` yields `inverter.temp = 41`.
/// Top-level numbers have no parent and are skipped, as are strings,
/// booleans, nulls and arrays.
pub fn flatten(doc: &Value) -> Vec<Observation> {
    let mut out = Vec::new();
    if let Value::Object(map) = doc {
        for (key, value) in map {
            if let Value::Object(_) = value {
                walk(key, value, &mut out);
            }
        }
    }
    out
}

fn walk(parent: &str, node: &Value, out: &mut Vec<Observation>) {
    let Value::Object(map) = node else {
        return;
    };

    for (key, value) in map {
        match value {
            Value::Object(_) => walk(key, value, out),
            Value::Number(n) => {
                if let Some(v) = n.as_f64().filter(|v| v.is_finite()) {
                    out.push(Observation {
                        key: SeriesKey::new(parent, key.as_str()),
                        value: v,
                    });
                }
            }
            _ => {}
        }
    }
}

/// Resolve a dotted path such as `inverter.valid_info`.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, segment| node.get(segment))
}

/// Whether the document passes the validity gate. An empty path disables
/// the gate.
pub fn gate(doc: &Value, valid_field: &str) -> bool {
    if valid_field.is_empty() {
        return true;
    }
    lookup(doc, valid_field).and_then(Value::as_f64) == Some(1.0)
}

/// Wait before the next poll, adapted to the device's reported read latency.
///
/// The latency is rounded up to a multiple of five seconds with a five
/// second floor. A missing, non-numeric or negative latency falls back to
/// `default`, as does an empty `latency_field`.
pub fn next_poll_interval(
    doc: &Value,
    latency_field: &str,
    unit: LatencyUnit,
    default: Duration,
) -> Duration {
    if latency_field.is_empty() {
        return default;
    }

    let Some(raw) = lookup(doc, latency_field).and_then(Value::as_f64) else {
        return default;
    };
    if !raw.is_finite() || raw < 0.0 {
        return default;
    }

    let secs = match unit {
        LatencyUnit::S => raw,
        LatencyUnit::Ms => raw / 1000.0,
    };

    let steps = (secs / POLL_STEP_SECS as f64).ceil().max(1.0);
    if steps > (u64::MAX / POLL_STEP_SECS) as f64 {
        return default;
    }

    Duration::from_secs(steps as u64 * POLL_STEP_SECS)
}
