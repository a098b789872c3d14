use std::time::{Duration, SystemTime};

use super::state::{BridgeState, SeriesKey, ValueRecord};

/// Re-emission rules for unchanged values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Minimum time since the last primary write before re-emitting.
    pub interval: Duration,
    /// Series not observed for at least this long are skipped.
    pub stale_after: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
        }
    }
}

impl HeartbeatPolicy {
    /// Whether `record` should be re-emitted at `now`.
    pub fn is_due(&self, record: &ValueRecord, now: SystemTime) -> bool {
        if record.last_value() == 0.0 {
            return false;
        }

        if elapsed(record.last_observed_at(), now) >= self.stale_after {
            return false;
        }

        match record.last_written_at() {
            Some(written) => elapsed(written, now) >= self.interval,
            None => true,
        }
    }

    /// Every series due for a heartbeat at `now`, sorted by key.
    pub fn due(&self, state: &BridgeState, now: SystemTime) -> Vec<(SeriesKey, f64)> {
        let mut due: Vec<_> = state
            .iter()
            .filter(|(_, record)| self.is_due(record, now))
            .map(|(key, record)| (key.clone(), record.last_value()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));
        due
    }
}

/// Time from `since` to `now`; zero if the clock stepped backwards.
fn elapsed(since: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or(Duration::ZERO)
}
