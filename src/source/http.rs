use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::flatten::{flatten, gate, next_poll_interval};
use super::SourceEvent;
use crate::config::HttpSourceConfig;
use crate::export::health::HealthMetrics;

/// Result of a poll that reached the endpoint and got a JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The document passed the validity gate and was forwarded.
    Absorbed {
        observations: usize,
        next_wait: Duration,
    },
    /// The document failed the validity gate; nothing was forwarded.
    Gated,
    /// The bridge queue is closed.
    Closed,
}

/// Polls an HTTP endpoint for a JSON document and forwards its numeric
/// leaves.
pub struct HttpSource {
    cfg: HttpSourceConfig,
    client: reqwest::Client,
    metrics: Option<Arc<HealthMetrics>>,
}

impl HttpSource {
    pub fn new(cfg: HttpSourceConfig, metrics: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            cfg,
            client,
            metrics,
        })
    }

    /// Poll until cancelled or the bridge queue closes. Transport failures
    /// and gated documents wait the configured poll interval.
    pub async fn run(self, tx: mpsc::Sender<SourceEvent>, cancel: CancellationToken) -> Result<()> {
        info!(url = %self.cfg.url, interval = ?self.cfg.poll_interval, "HTTP source started");

        loop {
            let wait = match self.poll_once(&tx).await {
                Ok(PollOutcome::Absorbed {
                    observations,
                    next_wait,
                }) => {
                    debug!(observations, next_wait = ?next_wait, "poll absorbed");
                    self.count_poll("ok");
                    next_wait
                }
                Ok(PollOutcome::Gated) => {
                    warn!(field = %self.cfg.valid_field, "document failed validity check, skipping");
                    self.count_poll("gated");
                    self.cfg.poll_interval
                }
                Ok(PollOutcome::Closed) => return Ok(()),
                Err(e) => {
                    warn!(url = %self.cfg.url, error = %format!("{e:#}"), "poll failed");
                    self.count_poll("error");
                    self.cfg.poll_interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Fetch one document and forward it. Errors are transport or decode
    /// failures; a valid response that fails the gate is `Gated`.
    pub async fn poll_once(&self, tx: &mpsc::Sender<SourceEvent>) -> Result<PollOutcome> {
        let doc = self.fetch().await?;

        if !gate(&doc, &self.cfg.valid_field) {
            return Ok(PollOutcome::Gated);
        }

        let next_wait = next_poll_interval(
            &doc,
            &self.cfg.latency_field,
            self.cfg.latency_unit,
            self.cfg.poll_interval,
        );

        let observations = flatten(&doc);
        let count = observations.len();
        for observation in observations {
            if tx.send(SourceEvent::Observation(observation)).await.is_err() {
                return Ok(PollOutcome::Closed);
            }
        }
        if tx.send(SourceEvent::BatchComplete).await.is_err() {
            return Ok(PollOutcome::Closed);
        }

        Ok(PollOutcome::Absorbed {
            observations: count,
            next_wait,
        })
    }

    async fn fetch(&self) -> Result<Value> {
        let resp = self
            .client
            .get(&self.cfg.url)
            .send()
            .await
            .with_context(|| format!("requesting {}", self.cfg.url))?
            .error_for_status()
            .with_context(|| format!("unexpected status from {}", self.cfg.url))?;

        resp.json::<Value>()
            .await
            .with_context(|| format!("decoding JSON from {}", self.cfg.url))
    }

    fn count_poll(&self, status: &str) {
        if let Some(m) = &self.metrics {
            m.source_polls.with_label_values(&[status]).inc();
        }
    }
}
