use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Default primary store request timeout.
pub const DEFAULT_PRIMARY_TIMEOUT: Duration = Duration::from_secs(15);

/// Default secondary store request timeout. Higher because the replica is
/// usually remote.
pub const DEFAULT_SECONDARY_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level configuration for the telebridge daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Capacity of the source-to-bridge event queue. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Where observations come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Primary (durable) store.
    #[serde(default)]
    pub primary: StoreConfig,

    /// Optional best-effort replica.
    #[serde(default)]
    pub secondary: Option<StoreConfig>,

    /// Heartbeat re-emission configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Primary/secondary reconciliation configuration.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which ingestion adapter feeds the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Mqtt,
    Http,
}

/// Source selection plus per-adapter settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Adapter type. Default: mqtt.
    #[serde(default, rename = "type")]
    pub kind: SourceKind,

    /// MQTT push source settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// HTTP poll source settings.
    #[serde(default)]
    pub http: HttpSourceConfig,
}

/// MQTT broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname.
    #[serde(default)]
    pub host: String,

    /// Broker port. Default: 1883.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// MQTT client identifier. Default: "telebridge".
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Broker username (auth is only sent when both username and password are set).
    #[serde(default)]
    pub username: String,

    /// Broker password.
    #[serde(default)]
    pub password: String,

    /// Topic filters to subscribe to.
    #[serde(default)]
    pub topics: Vec<String>,

    /// Keep-alive interval. Default: 60s.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Time after the first message before the series state counts as
    /// initialized. Default: 10s.
    #[serde(default = "default_warmup", with = "humantime_serde")]
    pub warmup: Duration,

    /// Delay before reconnecting after a connection error. Default: 5s.
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

/// Unit of the server-suggested read latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyUnit {
    #[default]
    S,
    Ms,
}

/// HTTP JSON poll source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    /// Endpoint returning the JSON document.
    #[serde(default)]
    pub url: String,

    /// Default wait between polls. Default: 15s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Dotted path of the validity flag; documents where it is not 1 are
    /// skipped. Empty disables the gate. Default: "inverter.valid_info".
    #[serde(default = "default_valid_field")]
    pub valid_field: String,

    /// Dotted path of the mean read latency used to adapt the poll interval.
    /// Empty disables adaptation. Default: "inverter.read_time_mean".
    #[serde(default = "default_latency_field")]
    pub latency_field: String,

    /// Unit of `latency_field`. Default: s.
    #[serde(default)]
    pub latency_unit: LatencyUnit,
}

/// InfluxDB v2 store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Base URL, e.g. "http://localhost:8086".
    #[serde(default)]
    pub url: String,

    /// API token.
    #[serde(default)]
    pub token: String,

    /// Organization name.
    #[serde(default)]
    pub org: String,

    /// Target bucket. For the secondary store, empty means "same as primary".
    #[serde(default)]
    pub bucket: String,

    /// Request timeout. Default: 15s primary, 30s secondary.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Write body compression (none, gzip). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the heartbeat sweep runs. Default: 60s.
    #[serde(default = "default_heartbeat_period", with = "humantime_serde")]
    pub period: Duration,

    /// Minimum time since the last write before a value is re-emitted. Default: 60s.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Values not observed for this long are stale and never re-emitted. Default: 120s.
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// How often the sweep runs. Default: 30m.
    #[serde(default = "default_reconcile_period", with = "humantime_serde")]
    pub period: Duration,

    /// Trailing window compared on each sweep. Default: 6h.
    #[serde(default = "default_reconcile_window", with = "humantime_serde")]
    pub window: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "telebridge".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_warmup() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_valid_field() -> String {
    "inverter.valid_info".to_string()
}

fn default_latency_field() -> String {
    "inverter.read_time_mean".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_heartbeat_period() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(120)
}

fn default_reconcile_period() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_reconcile_window() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            channel_capacity: default_channel_capacity(),
            source: SourceConfig::default(),
            primary: StoreConfig::default(),
            secondary: None,
            heartbeat: HeartbeatConfig::default(),
            reconcile: ReconcileConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: String::new(),
            password: String::new(),
            topics: Vec::new(),
            keep_alive: default_keep_alive(),
            warmup: default_warmup(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            poll_interval: default_poll_interval(),
            timeout: default_http_timeout(),
            valid_field: default_valid_field(),
            latency_field: default_latency_field(),
            latency_unit: LatencyUnit::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period: default_heartbeat_period(),
            interval: default_heartbeat_interval(),
            stale_after: default_stale_after(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            period: default_reconcile_period(),
            window: default_reconcile_window(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::parse(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;

        cfg.apply_fallbacks();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Fill fields whose default depends on other fields.
    fn apply_fallbacks(&mut self) {
        let primary_bucket = self.primary.bucket.clone();
        if let Some(secondary) = &mut self.secondary {
            if secondary.bucket.is_empty() {
                secondary.bucket = primary_bucket;
            }
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }

        validate_store("primary", &self.primary)?;
        if let Some(secondary) = &self.secondary {
            validate_store("secondary", secondary)?;
        }

        match self.source.kind {
            SourceKind::Mqtt => {
                let mqtt = &self.source.mqtt;
                if mqtt.host.is_empty() {
                    bail!("source.mqtt.host is required");
                }
                if mqtt.topics.iter().all(|t| t.trim().is_empty()) {
                    bail!("source.mqtt.topics must list at least one topic");
                }
                if mqtt.keep_alive.is_zero() {
                    bail!("source.mqtt.keep_alive must be positive");
                }
            }
            SourceKind::Http => {
                let http = &self.source.http;
                if http.url.is_empty() {
                    bail!("source.http.url is required");
                }
                if http.poll_interval.is_zero() {
                    bail!("source.http.poll_interval must be positive");
                }
            }
        }

        if self.heartbeat.period.is_zero() {
            bail!("heartbeat.period must be positive");
        }
        if self.heartbeat.interval.is_zero() {
            bail!("heartbeat.interval must be positive");
        }
        if self.heartbeat.stale_after.is_zero() {
            bail!("heartbeat.stale_after must be positive");
        }

        if self.reconcile.period.is_zero() {
            bail!("reconcile.period must be positive");
        }
        if self.reconcile.window.is_zero() {
            bail!("reconcile.window must be positive");
        }

        Ok(())
    }
}

fn validate_store(name: &str, cfg: &StoreConfig) -> Result<()> {
    if cfg.url.is_empty() {
        bail!("{name}.url is required");
    }
    if cfg.org.is_empty() {
        bail!("{name}.org is required");
    }
    if cfg.bucket.is_empty() {
        bail!("{name}.bucket is required");
    }
    match cfg.compression.as_str() {
        "none" | "gzip" => {}
        other => bail!("invalid {name}.compression: {other}"),
    }
    if cfg.timeout.is_some_and(|t| t.is_zero()) {
        bail!("{name}.timeout must be positive");
    }

    Ok(())
}
