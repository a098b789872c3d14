use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::topic::decode;
use super::SourceEvent;
use crate::config::MqttConfig;
use crate::export::health::HealthMetrics;

/// Upper bound on flushing the DISCONNECT packet at shutdown.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Tracks when a push source counts as warmed up.
///
/// The first message arms a deadline `period` later; a zero period is ready
/// on the first message.
#[derive(Debug)]
struct Warmup {
    period: Duration,
    ready_at: Option<Instant>,
    done: bool,
}

impl Warmup {
    fn new(period: Duration) -> Self {
        Self {
            period,
            ready_at: None,
            done: false,
        }
    }

    /// Note a received message. Returns true if the source became ready.
    fn on_message(&mut self, now: Instant) -> bool {
        if self.done || self.ready_at.is_some() {
            return false;
        }
        if self.period.is_zero() {
            self.done = true;
            return true;
        }
        self.ready_at = Some(now + self.period);
        false
    }

    fn deadline(&self) -> Option<Instant> {
        if self.done {
            None
        } else {
            self.ready_at
        }
    }

    fn fire(&mut self) {
        self.done = true;
    }
}

/// Subscribes to broker topics and forwards decoded messages.
pub struct MqttSource {
    cfg: MqttConfig,
    metrics: Option<Arc<HealthMetrics>>,
}

impl MqttSource {
    pub fn new(cfg: MqttConfig, metrics: Option<Arc<HealthMetrics>>) -> Self {
        Self { cfg, metrics }
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.cfg.client_id, &self.cfg.host, self.cfg.port);
        opts.set_keep_alive(self.cfg.keep_alive);

        if !self.cfg.username.is_empty() && !self.cfg.password.is_empty() {
            opts.set_credentials(&self.cfg.username, &self.cfg.password);
        }

        opts
    }

    /// Drive the MQTT session until cancelled or the bridge queue closes.
    /// Connection errors are retried after `reconnect_delay`.
    pub async fn run(self, tx: mpsc::Sender<SourceEvent>, cancel: CancellationToken) -> Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), self.cfg.topics.len() + 10);
        let mut warmup = Warmup::new(self.cfg.warmup);

        info!(
            host = %self.cfg.host,
            port = self.cfg.port,
            topics = self.cfg.topics.len(),
            "connecting to MQTT broker",
        );

        loop {
            let deadline = warmup.deadline();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warmup.fire();
                    info!(warmup = ?self.cfg.warmup, "MQTT source warmed up");
                    if tx.send(SourceEvent::Ready).await.is_err() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                        self.subscribe(&client);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if !self.forward(&publish.topic, &publish.payload, &tx, &mut warmup).await {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("broker closed the MQTT session");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in = ?self.cfg.reconnect_delay,
                            "MQTT connection error",
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.cfg.reconnect_delay) => {}
                        }
                    }
                },
            }
        }

        match client.try_disconnect() {
            Ok(()) => Self::flush_disconnect(&mut eventloop).await,
            Err(e) => debug!(error = %e, "MQTT disconnect request failed"),
        }
        info!("MQTT source stopped");

        Ok(())
    }

    /// Drive the event loop until the queued DISCONNECT has been written to
    /// the broker, the connection fails, or the timeout passes.
    async fn flush_disconnect(eventloop: &mut EventLoop) {
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "MQTT connection closed before disconnect");
                        return false;
                    }
                }
            }
        };

        match tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await {
            Ok(true) => debug!("MQTT disconnect sent"),
            Ok(false) => {}
            Err(_) => warn!(timeout = ?DISCONNECT_TIMEOUT, "MQTT disconnect timed out"),
        }
    }

    /// Subscribe to every configured topic. Runs on each ConnAck so a
    /// reconnect restores the subscriptions.
    fn subscribe(&self, client: &AsyncClient) {
        for topic in self.cfg.topics.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            match client.try_subscribe(topic, QoS::AtMostOnce) {
                Ok(()) => info!(topic, "subscribed"),
                Err(e) => warn!(topic, error = %e, "subscribe request failed"),
            }
        }
    }

    /// Decode one message and push it onto the queue. Returns false once the
    /// bridge side of the queue is gone.
    async fn forward(
        &self,
        topic: &str,
        payload: &[u8],
        tx: &mpsc::Sender<SourceEvent>,
        warmup: &mut Warmup,
    ) -> bool {
        match decode(topic, payload) {
            Ok(observation) => {
                if tx.send(SourceEvent::Observation(observation)).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                warn!(topic, error = %e, "dropping malformed message");
                if let Some(m) = &self.metrics {
                    m.observations_dropped.with_label_values(&[e.reason()]).inc();
                }
            }
        }

        if warmup.on_message(Instant::now()) {
            info!("MQTT source ready on first message");
            if tx.send(SourceEvent::Ready).await.is_err() {
                return false;
            }
        }

        true
    }
}
