//! Bounded pool of connection handlers for one listener.
//!
//! Each accepted request takes an [`Admission`] and keeps it for as long as
//! it runs, including an upgraded WebSocket session. `stop` refuses new
//! admissions; `join` waits until every admitted handler has finished.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

/// Smallest capacity the configuration allows.
pub const MIN_POOL_CAPACITY: usize = 4;

/// Proof that a handler is counted by the pool. Dropping it frees the slot.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    _token: TaskTrackerToken,
}

#[derive(Debug)]
pub struct ConnectionPool {
    name: &'static str,
    capacity: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ConnectionPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
        }
    }

    /// Take a slot, unless the pool is full or stopped.
    pub fn admit(&self) -> Option<Admission> {
        if self.tracker.is_closed() {
            return None;
        }
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Some(Admission {
                _permit: permit,
                _token: self.tracker.token(),
            }),
            Err(_) => {
                tracing::warn!(
                    pool = self.name,
                    capacity = self.capacity,
                    "Connection pool exhausted"
                );
                None
            }
        }
    }

    pub fn stop(&self) {
        self.tracker.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Wait for every admitted handler. Only returns after [`stop`](Self::stop).
    pub async fn join(&self) {
        self.tracker.wait().await;
        tracing::debug!(pool = self.name, "Connection pool drained");
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.tracker.len()
    }
}
