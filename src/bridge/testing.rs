//! In-memory store double shared by the bridge unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::store::{Point, QueryRow, StoreError, TimeSeriesStore};

pub(crate) struct MemoryStore {
    name: String,
    points: Mutex<Vec<Point>>,
    fail_writes: AtomicBool,
    fail_queries: AtomicBool,
    write_attempts: AtomicUsize,
    write_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            points: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Insert a point directly, bypassing attempt accounting.
    pub(crate) fn seed(&self, point: Point) {
        self.points.lock().push(point);
    }

    pub(crate) fn points(&self) -> Vec<Point> {
        self.points.lock().clone()
    }

    pub(crate) fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every write take `delay` before it resolves.
    pub(crate) fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub(crate) fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }
}

impl TimeSeriesStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, point: &Point) -> Result<(), StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(format!("{} is down", self.name)));
        }
        self.points.lock().push(point.clone());
        Ok(())
    }

    async fn query(&self, _window: Duration) -> Result<Vec<QueryRow>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self
            .points
            .lock()
            .iter()
            .map(|p| QueryRow {
                measurement: p.measurement().to_string(),
                timestamp: p.timestamp(),
                field: p.field().to_string(),
                value: p.value(),
            })
            .collect())
    }
}
