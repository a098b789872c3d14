use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use super::writer::PrimaryAck;

/// Identity of a tracked quantity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    measurement: String,
    field: String,
}

impl SeriesKey {
    pub fn new(measurement: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            field: field.into(),
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.measurement, self.field)
    }
}

/// Last known state of one series.
///
/// `last_written_at` can only move forward through
/// [`BridgeState::record_write`], which requires proof of a confirmed
/// primary write.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    last_value: f64,
    last_observed_at: SystemTime,
    last_written_at: Option<SystemTime>,
}

impl ValueRecord {
    pub(super) fn new(value: f64, observed_at: SystemTime) -> Self {
        Self {
            last_value: value,
            last_observed_at: observed_at,
            last_written_at: None,
        }
    }

    /// Most recently accepted value.
    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    /// When the series was last read from a source, written or not.
    pub fn last_observed_at(&self) -> SystemTime {
        self.last_observed_at
    }

    /// When the series was last confirmed by the primary store.
    pub fn last_written_at(&self) -> Option<SystemTime> {
        self.last_written_at
    }

    pub(super) fn set_value(&mut self, value: f64) {
        self.last_value = value;
    }

    pub(super) fn touch(&mut self, now: SystemTime) {
        self.last_observed_at = now;
    }
}

/// Process-wide tracking state: the series table and the initialized flag.
///
/// Owned by exactly one task (the bridge actor); every mutation goes through
/// `&mut self`.
#[derive(Debug, Default)]
pub struct BridgeState {
    initialized: bool,
    series: HashMap<SeriesKey, ValueRecord>,
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Flip to initialized. Returns true only on the first call.
    pub fn mark_initialized(&mut self) -> bool {
        let first = !self.initialized;
        self.initialized = true;
        first
    }

    pub fn get(&self, key: &SeriesKey) -> Option<&ValueRecord> {
        self.series.get(key)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SeriesKey, &ValueRecord)> {
        self.series.iter()
    }

    /// Record a confirmed primary write. The ack names the series it was
    /// minted for; unknown series are ignored.
    pub fn record_write(&mut self, ack: PrimaryAck) {
        if let Some(record) = self.series.get_mut(ack.key()) {
            record.last_written_at = Some(ack.written_at());
        }
    }

    pub(super) fn get_mut(&mut self, key: &SeriesKey) -> Option<&mut ValueRecord> {
        self.series.get_mut(key)
    }

    pub(super) fn insert(&mut self, key: SeriesKey, record: ValueRecord) {
        self.series.insert(key, record);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn test_mark_initialized_once() {
        let mut state = BridgeState::new();
        assert!(!state.is_initialized());
        assert!(state.mark_initialized());
        assert!(!state.mark_initialized());
        assert!(state.is_initialized());
    }

    #[test]
    fn test_record_write_sets_written_at() {
        let mut state = BridgeState::new();
        let key = SeriesKey::new("inverter", "temp");
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        state.insert(key.clone(), ValueRecord::new(21.0, t0));
        assert_eq!(state.get(&key).and_then(|r| r.last_written_at()), None);

        let t1 = t0 + Duration::from_secs(1);
        state.record_write(PrimaryAck::for_test(key.clone(), t1));

        let record = state.get(&key).expect("record exists");
        assert_eq!(record.last_written_at(), Some(t1));
        assert_eq!(record.last_observed_at(), t0);
    }

    #[test]
    fn test_record_write_unknown_key_is_ignored() {
        let mut state = BridgeState::new();
        let t = UNIX_EPOCH + Duration::from_secs(1);
        state.record_write(PrimaryAck::for_test(SeriesKey::new("m", "f"), t));
        assert!(state.is_empty());
    }

    #[test]
    fn test_series_key_display() {
        assert_eq!(SeriesKey::new("battery", "soc").to_string(), "battery.soc");
    }
}
