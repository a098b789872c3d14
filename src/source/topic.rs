//! MQTT topic and payload decoding.
//!
//! A topic such as `/powmr/inverter.temp` carries the series identity in its
//! last segment: everything before the first `.` is the measurement, the rest
//! is the field. The payload is the value as text.

use thiserror::Error;

use super::Observation;
use crate::bridge::state::SeriesKey;

/// Why a message could not be turned into an observation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedInput {
    #[error("topic {0:?} has fewer than two segments")]
    TooFewSegments(String),

    #[error("topic {0:?} has no measurement.field segment")]
    MissingDot(String),

    #[error("topic {0:?} has an empty measurement or field")]
    EmptyName(String),

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload {0:?} is not a number")]
    NotNumeric(String),

    #[error("payload {0:?} is not a finite number")]
    NonFinite(String),
}

impl MalformedInput {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TooFewSegments(_) | Self::MissingDot(_) | Self::EmptyName(_) => "bad_topic",
            Self::NotUtf8 | Self::NotNumeric(_) => "bad_payload",
            Self::NonFinite(_) => "non_finite",
        }
    }
}

/// Decode one MQTT message into an observation.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Observation, MalformedInput> {
    let segments: Vec<&str> = topic.trim_matches('/').split('/').collect();
    if segments.len() < 2 {
        return Err(MalformedInput::TooFewSegments(topic.to_string()));
    }

    let last = segments[segments.len() - 1];
    let (measurement, field) = last
        .split_once('.')
        .ok_or_else(|| MalformedInput::MissingDot(topic.to_string()))?;
    if measurement.is_empty() || field.is_empty() {
        return Err(MalformedInput::EmptyName(topic.to_string()));
    }

    let text = std::str::from_utf8(payload).map_err(|_| MalformedInput::NotUtf8)?;
    let text = text.trim();
    let value: f64 = text
        .parse()
        .map_err(|_| MalformedInput::NotNumeric(text.to_string()))?;
    if !value.is_finite() {
        return Err(MalformedInput::NonFinite(text.to_string()));
    }

    Ok(Observation {
        key: SeriesKey::new(measurement, field),
        value,
    })
}
