use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::store::{Point, QueryRow, TimeSeriesStore};

/// Columns that describe a query row rather than a measured field.
const METADATA_FIELDS: &[&str] = &["_time", "_measurement", "_start", "_stop", "result", "table"];

/// Summary of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Distinct `(measurement, timestamp)` records in the primary window.
    pub primary_records: usize,
    /// Distinct records in the secondary window.
    pub secondary_records: usize,
    /// Primary records absent from the secondary.
    pub missing_records: usize,
    /// Points successfully re-sent to the secondary.
    pub resynced: usize,
    /// Points the secondary rejected during the sweep.
    pub failed: usize,
    /// Set when a window query failed and no comparison was made.
    pub query_failed: bool,
    /// Set when shutdown interrupted the re-send loop.
    pub cancelled: bool,
}

type RecordId = (String, SystemTime);

/// Re-sends points present in the primary but missing from the secondary.
pub struct ReconciliationSweeper<S> {
    primary: Arc<S>,
    secondary: Arc<S>,
    window: Duration,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: TimeSeriesStore> ReconciliationSweeper<S> {
    pub fn new(primary: Arc<S>, secondary: Arc<S>, window: Duration) -> Self {
        Self {
            primary,
            secondary,
            window,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one sweep over the trailing window. Never fails; problems are
    /// logged and counted in the report.
    pub async fn sweep(&self, cancel: &CancellationToken) -> ReconcileReport {
        let start = Instant::now();
        let report = self.compare_and_resend(cancel).await;

        if let Some(metrics) = &self.metrics {
            let status = if report.query_failed {
                "query_failed"
            } else if report.cancelled {
                "cancelled"
            } else if report.failed > 0 {
                "partial"
            } else {
                "ok"
            };
            metrics.reconcile_runs.with_label_values(&[status]).inc();
            metrics.reconcile_resynced.inc_by(report.resynced as f64);
            metrics
                .reconcile_duration
                .observe(start.elapsed().as_secs_f64());
        }

        if report.resynced > 0 || report.failed > 0 {
            info!(
                missing_records = report.missing_records,
                resynced = report.resynced,
                failed = report.failed,
                duration_ms = start.elapsed().as_millis() as u64,
                "reconciliation sweep finished",
            );
        } else if !report.query_failed {
            debug!(
                primary_records = report.primary_records,
                secondary_records = report.secondary_records,
                "secondary is up to date",
            );
        }

        report
    }

    async fn compare_and_resend(&self, cancel: &CancellationToken) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let primary_rows = match self.primary.query(self.window).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(store = self.primary.name(), error = %e, "reconciliation query failed");
                report.query_failed = true;
                return report;
            }
        };

        let primary = group_records(&primary_rows);
        report.primary_records = primary.len();
        if primary.is_empty() {
            return report;
        }

        let secondary_rows = match self.secondary.query(self.window).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(store = self.secondary.name(), error = %e, "reconciliation query failed");
                report.query_failed = true;
                return report;
            }
        };

        let present: HashSet<RecordId> = secondary_rows
            .iter()
            .map(|row| (row.measurement.clone(), row.timestamp))
            .collect();
        report.secondary_records = present.len();

        for (id, rows) in &primary {
            if present.contains(id) {
                continue;
            }
            report.missing_records += 1;

            for row in rows {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return report;
                }
                if METADATA_FIELDS.contains(&row.field.as_str()) {
                    continue;
                }

                match self.secondary.write(&Point::from(*row)).await {
                    Ok(()) => report.resynced += 1,
                    Err(e) => {
                        warn!(
                            store = self.secondary.name(),
                            measurement = %row.measurement,
                            field = %row.field,
                            error = %e,
                            "failed to resync point",
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }
}

/// Group rows by record identity, ordered for deterministic re-send.
fn group_records(rows: &[QueryRow]) -> BTreeMap<RecordId, Vec<&QueryRow>> {
    let mut records: BTreeMap<RecordId, Vec<&QueryRow>> = BTreeMap::new();
    for row in rows {
        records
            .entry((row.measurement.clone(), row.timestamp))
            .or_default()
            .push(row);
    }
    records
}
