use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::state::BridgeState;
use crate::bridge::{Bridge, BridgeSettings};
use crate::config::{Config, SourceKind, DEFAULT_PRIMARY_TIMEOUT, DEFAULT_SECONDARY_TIMEOUT};
use crate::export::health::HealthMetrics;
use crate::source::http::HttpSource;
use crate::source::mqtt::MqttSource;
use crate::source::Source;
use crate::store::influx::InfluxStore;
use crate::store::TimeSeriesStore;

/// Agent wires configuration to stores, the bridge and the source, and owns
/// their lifecycle.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    source_task: Option<JoinHandle<Result<()>>>,
    bridge_task: Option<JoinHandle<BridgeState>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            source_task: None,
            bridge_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin ingestion.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so /healthz answers during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Stores.
        let primary = Arc::new(
            InfluxStore::new("primary", &self.cfg.primary, DEFAULT_PRIMARY_TIMEOUT)
                .context("creating primary store")?,
        );
        Self::check_store(&primary, &self.cfg.primary.url).await;

        let secondary = match &self.cfg.secondary {
            Some(cfg) => {
                let store = Arc::new(
                    InfluxStore::new("secondary", cfg, DEFAULT_SECONDARY_TIMEOUT)
                        .context("creating secondary store")?,
                );
                Self::check_store(&store, &cfg.url).await;
                Some(store)
            }
            None => {
                info!("no secondary store configured, running primary only");
                None
            }
        };

        // 2. Bridge, consuming a bounded queue.
        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity);
        let bridge = Bridge::new(
            primary,
            secondary,
            BridgeSettings::from_config(&self.cfg),
            Some(Arc::clone(&self.health)),
        );
        self.bridge_task = Some(bridge.spawn(rx, self.cancel.child_token()));

        // 3. Source, producing into the queue.
        let source = self.create_source()?;
        info!(source = source.name(), "starting source");
        let cancel = self.cancel.child_token();
        self.source_task = Some(tokio::spawn(source.run(tx, cancel)));

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Source first; dropping its sender also lets the bridge drain.
        if let Some(task) = self.source_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "source stopped with error"),
                Err(e) => warn!(error = %e, "source task join failed"),
            }
        }

        if let Some(task) = self.bridge_task.take() {
            match task.await {
                Ok(state) => info!(
                    series = state.len(),
                    initialized = state.is_initialized(),
                    "bridge stopped",
                ),
                Err(e) => warn!(error = %e, "bridge task join failed"),
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    fn create_source(&self) -> Result<Source> {
        let metrics = Some(Arc::clone(&self.health));

        let source = match self.cfg.source.kind {
            SourceKind::Mqtt => Source::Mqtt(MqttSource::new(self.cfg.source.mqtt.clone(), metrics)),
            SourceKind::Http => Source::Http(
                HttpSource::new(self.cfg.source.http.clone(), metrics)
                    .context("creating HTTP source")?,
            ),
        };

        Ok(source)
    }

    /// Ping a store at startup. Unreachable stores are not fatal; writes
    /// fail and recover on their own schedule.
    async fn check_store(store: &InfluxStore, url: &str) {
        match store.ping().await {
            Ok(()) => info!(store = store.name(), url, "store reachable"),
            Err(e) => warn!(
                store = store.name(),
                url,
                error = %format!("{e:#}"),
                "store unreachable at startup, continuing",
            ),
        }
    }
}
