pub mod flatten;
pub mod http;
pub mod mqtt;
pub mod topic;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::state::SeriesKey;

use self::http::HttpSource;
use self::mqtt::MqttSource;

/// One decoded `(series, value)` sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: SeriesKey,
    pub value: f64,
}

/// Everything a source can tell the bridge, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Observation(Observation),
    /// A poll source absorbed one complete document.
    BatchComplete,
    /// A push source finished its warm-up period.
    Ready,
}

/// Ingestion adapter feeding the bridge queue.
///
/// Enum dispatch keeps the run future concrete for `tokio::spawn`.
pub enum Source {
    Mqtt(MqttSource),
    Http(HttpSource),
}

impl Source {
    /// Returns the source name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Mqtt(_) => "mqtt",
            Self::Http(_) => "http",
        }
    }

    /// Deliver events into `tx` until cancelled or the bridge goes away.
    pub async fn run(
        self,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        match self {
            Self::Mqtt(s) => s.run(tx, cancel).await,
            Self::Http(s) => s.run(tx, cancel).await,
        }
    }
}
