//! Decides whether an observation is worth persisting.
//!
//! Before initialization every value seeds state but zeros are never
//! written. Afterwards a new series is written unless it is zero, and an
//! existing series is written only when its value differs exactly from the
//! stored one.

use std::time::SystemTime;

use super::state::{BridgeState, SeriesKey, ValueRecord};

/// Why an observation did or did not lead to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Seeding before initialization, value non-zero.
    Seed,
    /// Seeding before initialization, value zero.
    SeedZero,
    /// First sighting of a series after initialization, value non-zero.
    New,
    /// First sighting of a series after initialization, value zero.
    NewZero,
    /// Value differs from the stored one.
    Changed,
    /// Value equals the stored one.
    Unchanged,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::SeedZero => "seed_zero",
            Self::New => "new",
            Self::NewZero => "new_zero",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of evaluating one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub write: bool,
    pub reason: Reason,
    pub previous: Option<f64>,
    pub record: ValueRecord,
}

/// Apply one observation to `state`.
///
/// `last_observed_at` is refreshed for every call regardless of outcome.
pub fn evaluate(
    state: &mut BridgeState,
    key: &SeriesKey,
    value: f64,
    now: SystemTime,
) -> Evaluation {
    let initialized = state.is_initialized();

    let (reason, previous) = match state.get_mut(key) {
        Some(record) => {
            record.touch(now);
            let previous = record.last_value();

            let reason = if !initialized {
                record.set_value(value);
                seed_reason(value)
            } else if previous != value {
                record.set_value(value);
                Reason::Changed
            } else {
                Reason::Unchanged
            };

            (reason, Some(previous))
        }
        None => {
            state.insert(key.clone(), ValueRecord::new(value, now));

            let reason = if !initialized {
                seed_reason(value)
            } else if value != 0.0 {
                Reason::New
            } else {
                Reason::NewZero
            };

            (reason, None)
        }
    };

    let record = match state.get(key) {
        Some(record) => record.clone(),
        None => ValueRecord::new(value, now),
    };

    Evaluation {
        write: matches!(reason, Reason::Seed | Reason::New | Reason::Changed),
        reason,
        previous,
        record,
    }
}

fn seed_reason(value: f64) -> Reason {
    if value != 0.0 {
        Reason::Seed
    } else {
        Reason::SeedZero
    }
}
