pub mod detector;
pub mod heartbeat;
pub mod reconcile;
pub mod state;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::source::{Observation, SourceEvent};
use crate::store::TimeSeriesStore;

use self::detector::evaluate;
use self::heartbeat::HeartbeatPolicy;
use self::reconcile::{ReconcileReport, ReconciliationSweeper};
use self::state::BridgeState;
use self::writer::{WriteCoordinator, WriteKind, WriteOutcome};

/// Timing knobs for the bridge loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub heartbeat: HeartbeatPolicy,
    pub heartbeat_period: Duration,
    pub reconcile_period: Duration,
    pub reconcile_window: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatPolicy::default(),
            heartbeat_period: Duration::from_secs(60),
            reconcile_period: Duration::from_secs(30 * 60),
            reconcile_window: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl BridgeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            heartbeat: HeartbeatPolicy {
                interval: cfg.heartbeat.interval,
                stale_after: cfg.heartbeat.stale_after,
            },
            heartbeat_period: cfg.heartbeat.period,
            reconcile_period: cfg.reconcile.period,
            reconcile_window: cfg.reconcile.window,
        }
    }
}

/// Counts from one heartbeat tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub due: usize,
    pub written: usize,
    pub failed: usize,
    /// Set when shutdown interrupted the tick before every due write ran.
    pub cancelled: bool,
}

/// Single owner of [`BridgeState`].
///
/// Observations, initialization signals, heartbeat ticks and reconciliation
/// ticks are all applied from one task, so state updates are serialized
/// without a lock. Reconciliation only touches the stores and runs on its
/// own task.
pub struct Bridge<S> {
    state: BridgeState,
    writer: WriteCoordinator<S>,
    sweeper: Option<Arc<ReconciliationSweeper<S>>>,
    settings: BridgeSettings,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: TimeSeriesStore> Bridge<S> {
    pub fn new(
        primary: Arc<S>,
        secondary: Option<Arc<S>>,
        settings: BridgeSettings,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let sweeper = secondary.as_ref().map(|secondary| {
            let sweeper = ReconciliationSweeper::new(
                Arc::clone(&primary),
                Arc::clone(secondary),
                settings.reconcile_window,
            );
            Arc::new(match &metrics {
                Some(m) => sweeper.with_metrics(Arc::clone(m)),
                None => sweeper,
            })
        });

        let writer = WriteCoordinator::new(primary, secondary);
        let writer = match &metrics {
            Some(m) => writer.with_metrics(Arc::clone(m)),
            None => writer,
        };

        Self {
            state: BridgeState::new(),
            writer,
            sweeper,
            settings,
            metrics,
        }
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    pub fn into_state(self) -> BridgeState {
        self.state
    }

    /// Flip the series state to initialized; later calls are no-ops.
    pub fn mark_initialized(&mut self) {
        if self.state.mark_initialized() {
            info!(series = self.state.len(), "series state initialized");
            if let Some(m) = &self.metrics {
                m.initialized.set(1.0);
            }
        }
    }

    /// Apply one observation. Returns the write outcome when the value was
    /// worth persisting.
    pub async fn observe(
        &mut self,
        observation: &Observation,
        now: SystemTime,
    ) -> Option<WriteOutcome> {
        let eval = evaluate(&mut self.state, &observation.key, observation.value, now);

        if let Some(m) = &self.metrics {
            m.observations_received.inc();
            m.series_tracked.set(self.state.len() as f64);
        }

        if !eval.write {
            return None;
        }

        debug!(
            key = %observation.key,
            value = observation.value,
            previous = ?eval.previous,
            reason = eval.reason.as_str(),
            "value accepted",
        );

        let outcome = self
            .writer
            .write(&observation.key, observation.value, now, WriteKind::Change)
            .await;

        if let WriteOutcome::Written { ack, .. } = &outcome {
            self.state.record_write(ack.clone());
        }

        Some(outcome)
    }

    /// Re-emit every live, non-zero value that has not been written for a
    /// heartbeat interval. Does nothing before initialization.
    ///
    /// Cancellation is checked between writes; a write already in flight
    /// completes first.
    pub async fn heartbeat(
        &mut self,
        now: SystemTime,
        cancel: &CancellationToken,
    ) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        if !self.state.is_initialized() {
            return report;
        }

        let due = self.settings.heartbeat.due(&self.state, now);
        report.due = due.len();

        for (key, value) in due {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.writer.write(&key, value, now, WriteKind::Heartbeat).await {
                WriteOutcome::Written { ack, .. } => {
                    self.state.record_write(ack);
                    report.written += 1;
                }
                WriteOutcome::PrimaryFailed(_) => report.failed += 1,
            }
        }

        if let Some(m) = &self.metrics {
            m.heartbeat_writes.inc_by(report.written as f64);
        }

        if report.due > 0 {
            debug!(
                due = report.due,
                written = report.written,
                failed = report.failed,
                cancelled = report.cancelled,
                "heartbeat tick",
            );
        }

        report
    }

    /// Apply one event from the source queue.
    pub async fn handle(&mut self, event: SourceEvent, now: SystemTime) {
        match event {
            SourceEvent::Observation(observation) => {
                self.observe(&observation, now).await;
            }
            SourceEvent::BatchComplete | SourceEvent::Ready => self.mark_initialized(),
        }
    }

    /// Start a reconciliation sweep unless one is pointless or already running.
    fn start_sweep(
        &self,
        running: &mut Option<JoinHandle<ReconcileReport>>,
        cancel: &CancellationToken,
    ) {
        let Some(sweeper) = &self.sweeper else {
            return;
        };

        if !self.state.is_initialized() {
            debug!("skipping reconciliation, series state not initialized");
            return;
        }

        if running.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("skipping reconciliation, previous sweep still running");
            return;
        }

        let sweeper = Arc::clone(sweeper);
        let cancel = cancel.clone();
        *running = Some(tokio::spawn(async move { sweeper.sweep(&cancel).await }));
    }

    /// Consume source events and timer ticks until cancelled or the source
    /// side of the queue is dropped. Returns the final state.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SourceEvent>,
        cancel: CancellationToken,
    ) -> BridgeState {
        let heartbeat_period = self.settings.heartbeat_period;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reconcile_period = self.settings.reconcile_period;
        let mut reconcile = interval_at(Instant::now() + reconcile_period, reconcile_period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sweep: Option<JoinHandle<ReconcileReport>> = None;

        info!(
            heartbeat_period = ?heartbeat_period,
            reconcile = self.sweeper.is_some(),
            reconcile_period = ?reconcile_period,
            "bridge started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event, SystemTime::now()).await,
                    None => {
                        info!("source queue closed, stopping bridge");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    self.heartbeat(SystemTime::now(), &cancel).await;
                }
                _ = reconcile.tick() => self.start_sweep(&mut sweep, &cancel),
            }
        }

        if let Some(task) = sweep {
            if let Err(e) = task.await {
                warn!(error = %e, "reconciliation task join failed");
            }
        }

        self.state
    }

    /// Spawn [`Bridge::run`] on the current runtime.
    pub fn spawn(
        self,
        events: mpsc::Receiver<SourceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<BridgeState> {
        tokio::spawn(self.run(events, cancel))
    }
}
