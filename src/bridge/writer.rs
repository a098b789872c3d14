use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, error, warn};

use super::state::SeriesKey;
use crate::export::health::HealthMetrics;
use crate::store::{Point, StoreError, TimeSeriesStore};

/// Why a point is being written. Affects logging and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Change,
    Heartbeat,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Proof that the primary store accepted a point.
///
/// Only [`WriteCoordinator`] can mint one, and
/// [`BridgeState::record_write`](super::state::BridgeState::record_write)
/// is the only way to advance `last_written_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryAck {
    key: SeriesKey,
    written_at: SystemTime,
}

impl PrimaryAck {
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn written_at(&self) -> SystemTime {
        self.written_at
    }

    #[cfg(test)]
    pub(crate) fn for_test(key: SeriesKey, written_at: SystemTime) -> Self {
        Self { key, written_at }
    }
}

/// What happened on the secondary store after a successful primary write.
#[derive(Debug)]
pub enum SecondaryOutcome {
    NotConfigured,
    Written,
    Failed(StoreError),
}

/// Result of one coordinated write.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The primary accepted the point. Secondary failures never demote this.
    Written {
        ack: PrimaryAck,
        secondary: SecondaryOutcome,
    },
    /// The primary rejected the point or was unreachable. The secondary was
    /// not attempted.
    PrimaryFailed(StoreError),
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Writes points to the primary store and, on success, to the secondary.
pub struct WriteCoordinator<S> {
    primary: Arc<S>,
    secondary: Option<Arc<S>>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: TimeSeriesStore> WriteCoordinator<S> {
    pub fn new(primary: Arc<S>, secondary: Option<Arc<S>>) -> Self {
        Self {
            primary,
            secondary,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Persist `value` for `key` stamped with `now`.
    pub async fn write(
        &self,
        key: &SeriesKey,
        value: f64,
        now: SystemTime,
        kind: WriteKind,
    ) -> WriteOutcome {
        let point = Point::new(key.measurement(), key.field(), value, now);

        if let Err(e) = self.write_one(self.primary.as_ref(), &point, kind).await {
            error!(
                store = self.primary.name(),
                key = %key,
                value,
                heartbeat = kind == WriteKind::Heartbeat,
                error = %e,
                "primary write failed",
            );
            return WriteOutcome::PrimaryFailed(e);
        }

        debug!(
            store = self.primary.name(),
            key = %key,
            value,
            heartbeat = kind == WriteKind::Heartbeat,
            "written",
        );

        let ack = PrimaryAck {
            key: key.clone(),
            written_at: now,
        };

        let secondary = match &self.secondary {
            None => SecondaryOutcome::NotConfigured,
            Some(store) => match self.write_one(store.as_ref(), &point, kind).await {
                Ok(()) => SecondaryOutcome::Written,
                Err(e) => {
                    warn!(
                        store = store.name(),
                        key = %key,
                        error = %e,
                        "secondary write failed, reconciliation will catch up",
                    );
                    SecondaryOutcome::Failed(e)
                }
            },
        };

        WriteOutcome::Written { ack, secondary }
    }

    async fn write_one(&self, store: &S, point: &Point, kind: WriteKind) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = store.write(point).await;

        if let Some(metrics) = &self.metrics {
            metrics
                .store_write_duration
                .with_label_values(&[store.name()])
                .observe(start.elapsed().as_secs_f64());

            match &result {
                Ok(()) => metrics
                    .writes_total
                    .with_label_values(&[store.name(), kind.as_str()])
                    .inc(),
                Err(e) => metrics
                    .write_errors
                    .with_label_values(&[store.name(), e.kind()])
                    .inc(),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::bridge::testing::MemoryStore;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_write_primary_and_secondary() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        let writer = WriteCoordinator::new(Arc::clone(&primary), Some(Arc::clone(&secondary)));
        let key = SeriesKey::new("battery", "soc");

        let outcome = writer.write(&key, 81.0, at(5), WriteKind::Change).await;

        match outcome {
            WriteOutcome::Written { ack, secondary: s } => {
                assert_eq!(ack.key(), &key);
                assert_eq!(ack.written_at(), at(5));
                assert!(matches!(s, SecondaryOutcome::Written));
            }
            WriteOutcome::PrimaryFailed(e) => panic!("unexpected failure: {e}"),
        }

        let expected = Point::new("battery", "soc", 81.0, at(5));
        assert_eq!(primary.points(), vec![expected.clone()]);
        assert_eq!(secondary.points(), vec![expected]);
    }

    #[tokio::test]
    async fn test_primary_failure_skips_secondary() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        primary.set_fail_writes(true);
        let writer = WriteCoordinator::new(Arc::clone(&primary), Some(Arc::clone(&secondary)));

        let outcome = writer
            .write(&SeriesKey::new("m", "f"), 1.0, at(1), WriteKind::Heartbeat)
            .await;

        assert!(matches!(
            outcome,
            WriteOutcome::PrimaryFailed(StoreError::Connection(_))
        ));
        assert_eq!(primary.write_attempts(), 1);
        assert_eq!(secondary.write_attempts(), 0);
    }

    #[tokio::test]
    async fn test_secondary_failure_is_isolated() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        secondary.set_fail_writes(true);
        let writer = WriteCoordinator::new(Arc::clone(&primary), Some(Arc::clone(&secondary)));

        let outcome = writer
            .write(&SeriesKey::new("m", "f"), 1.0, at(1), WriteKind::Change)
            .await;

        assert!(outcome.is_written());
        assert!(matches!(
            outcome,
            WriteOutcome::Written {
                secondary: SecondaryOutcome::Failed(_),
                ..
            }
        ));
        assert_eq!(primary.points().len(), 1);
    }

    #[tokio::test]
    async fn test_without_secondary() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let writer = WriteCoordinator::new(Arc::clone(&primary), None);

        let outcome = writer
            .write(&SeriesKey::new("m", "f"), 2.0, at(1), WriteKind::Change)
            .await;

        assert!(matches!(
            outcome,
            WriteOutcome::Written {
                secondary: SecondaryOutcome::NotConfigured,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_write_records_metrics() {
        let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let primary = Arc::new(MemoryStore::new("primary"));
        let secondary = Arc::new(MemoryStore::new("secondary"));
        secondary.set_fail_writes(true);
        let writer = WriteCoordinator::new(Arc::clone(&primary), Some(Arc::clone(&secondary)))
            .with_metrics(Arc::clone(&metrics));

        writer
            .write(&SeriesKey::new("m", "f"), 2.0, at(1), WriteKind::Heartbeat)
            .await;

        assert_eq!(
            metrics
                .writes_total
                .with_label_values(&["primary", "heartbeat"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics
                .write_errors
                .with_label_values(&["secondary", "connection"])
                .get(),
            1.0
        );
    }
}
