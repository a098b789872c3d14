pub mod influx;
pub mod line_protocol;

use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Errors returned by a time-series store.
///
/// Connection failures and application-level rejections are kept apart so
/// logs and metrics can tell them apart; the bridge treats both as a failed
/// write.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connection(String),

    #[error("store rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("decoding store response: {0}")]
    Decode(String),

    #[error("encoding point: {0}")]
    Encode(String),
}

impl StoreError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Rejected { .. } => "rejected",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
        }
    }
}

/// A single `(measurement, field, value, timestamp)` sample handed to a store.
///
/// Points are immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    field: String,
    value: f64,
    timestamp: SystemTime,
}

impl Point {
    pub fn new(
        measurement: impl Into<String>,
        field: impl Into<String>,
        value: f64,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            field: field.into(),
            value,
            timestamp,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// One decoded row of a store query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub measurement: String,
    pub timestamp: SystemTime,
    pub field: String,
    pub value: f64,
}

impl From<&QueryRow> for Point {
    fn from(row: &QueryRow) -> Self {
        Point::new(
            row.measurement.clone(),
            row.field.clone(),
            row.value,
            row.timestamp,
        )
    }
}

/// Destination store for points.
pub trait TimeSeriesStore: Send + Sync + 'static {
    /// Returns the store's name for logging and metrics.
    fn name(&self) -> &str;

    /// Persist a single point. Atomic per point.
    fn write(
        &self,
        point: &Point,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Return every point within the trailing `window`.
    fn query(
        &self,
        window: Duration,
    ) -> impl std::future::Future<Output = Result<Vec<QueryRow>, StoreError>> + Send;
}
