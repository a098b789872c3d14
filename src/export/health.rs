use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "telebridge";

/// Prometheus metrics for bridge health and observability.
///
/// All metrics use the "telebridge" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Observations applied by the bridge.
    pub observations_received: Counter,
    /// Messages dropped before reaching the bridge, by reason.
    pub observations_dropped: CounterVec,
    /// Poll attempts by status (ok/gated/error).
    pub source_polls: CounterVec,

    // === State ===
    /// Number of series currently tracked.
    pub series_tracked: Gauge,
    /// Whether the series state is initialized (1=yes, 0=no).
    pub initialized: Gauge,

    // === Writes ===
    /// Successful store writes by store and kind (change/heartbeat).
    pub writes_total: CounterVec,
    /// Failed store writes by store and error type.
    pub write_errors: CounterVec,
    /// Heartbeat re-emissions confirmed by the primary.
    pub heartbeat_writes: Counter,
    /// Store write latency by store (1ms-30s buckets).
    pub store_write_duration: HistogramVec,

    // === Reconciliation ===
    /// Reconciliation sweeps by status.
    pub reconcile_runs: CounterVec,
    /// Points re-sent to the secondary store.
    pub reconcile_resynced: Counter,
    /// Sweep duration (10ms-5min buckets).
    pub reconcile_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let observations_received = Counter::with_opts(
            Opts::new(
                "observations_received_total",
                "Total observations applied by the bridge.",
            )
            .namespace(NAMESPACE),
        )?;
        let observations_dropped = CounterVec::new(
            Opts::new(
                "observations_dropped_total",
                "Total messages dropped as malformed, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let source_polls = CounterVec::new(
            Opts::new("source_polls_total", "Total source polls by status.").namespace(NAMESPACE),
            &["status"],
        )?;

        // === State ===
        let series_tracked = Gauge::with_opts(
            Opts::new("series_tracked", "Number of series currently tracked.")
                .namespace(NAMESPACE),
        )?;
        let initialized = Gauge::with_opts(
            Opts::new(
                "initialized",
                "Whether the series state is initialized (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        // === Writes ===
        let writes_total = CounterVec::new(
            Opts::new("writes_total", "Total successful store writes by store and kind.")
                .namespace(NAMESPACE),
            &["store", "kind"],
        )?;
        let write_errors = CounterVec::new(
            Opts::new(
                "write_errors_total",
                "Total failed store writes by store and error type.",
            )
            .namespace(NAMESPACE),
            &["store", "error_type"],
        )?;
        let heartbeat_writes = Counter::with_opts(
            Opts::new(
                "heartbeat_writes_total",
                "Total heartbeat writes confirmed by the primary store.",
            )
            .namespace(NAMESPACE),
        )?;
        let store_write_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_write_duration_seconds",
                "Time to write a single point by store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]),
            &["store"],
        )?;

        // === Reconciliation ===
        let reconcile_runs = CounterVec::new(
            Opts::new(
                "reconcile_runs_total",
                "Total reconciliation sweeps by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let reconcile_resynced = Counter::with_opts(
            Opts::new(
                "reconcile_resynced_points_total",
                "Total points re-sent to the secondary store.",
            )
            .namespace(NAMESPACE),
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Time to complete one reconciliation sweep.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.1, 1.0, 5.0, 30.0, 60.0, 300.0]),
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(observations_received.clone()))?;
        registry.register(Box::new(observations_dropped.clone()))?;
        registry.register(Box::new(source_polls.clone()))?;
        registry.register(Box::new(series_tracked.clone()))?;
        registry.register(Box::new(initialized.clone()))?;
        registry.register(Box::new(writes_total.clone()))?;
        registry.register(Box::new(write_errors.clone()))?;
        registry.register(Box::new(heartbeat_writes.clone()))?;
        registry.register(Box::new(store_write_duration.clone()))?;
        registry.register(Box::new(reconcile_runs.clone()))?;
        registry.register(Box::new(reconcile_resynced.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            observations_received,
            observations_dropped,
            source_polls,
            series_tracked,
            initialized,
            writes_total,
            write_errors,
            heartbeat_writes,
            store_write_duration,
            reconcile_runs,
            reconcile_resynced,
            reconcile_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Render every registered metric in Prometheus text format.
    #[cfg(test)]
    pub(crate) fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.observations_received.inc();
        metrics.initialized.set(1.0);
        metrics
            .writes_total
            .with_label_values(&["primary", "change"])
            .inc();

        let text = metrics.render().expect("render");
        assert!(text.contains("telebridge_observations_received_total 1"));
        assert!(text.contains("telebridge_initialized 1"));
        assert!(text.contains("telebridge_writes_total{kind=\"change\",store=\"primary\"} 1"));
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_healthz() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.series_tracked.set(3.0);
        let addr = metrics.start().await.expect("start");

        let client = reqwest::Client::new();
        let health = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz request")
            .text()
            .await
            .expect("healthz body");
        assert_eq!(health, "ok");

        let body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics request")
            .text()
            .await
            .expect("metrics body");
        assert!(body.contains("telebridge_series_tracked 3"));

        metrics.stop().await.expect("stop");
    }
}
