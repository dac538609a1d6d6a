//! Pairing of client sessions with idle workers.
//!
//! Workers announce themselves on the loopback port and wait in the available
//! pool. A client's first `load` claims one; from then on the two sessions
//! forward to each other until either side ends.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Outbound, SessionError, SessionId, SessionIds};
use crate::jail::Jail;
use crate::startup::BrokerPipe;
use crate::supervisor::TrackedView;

/// Default wait for a worker to become available.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

/// Line written to the broker FIFO after a worker has been claimed.
const SPAWN_REQUEST: &str = "spawn 1";

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub jail: Jail,
    pub claim_timeout: Duration,
}

impl BrokerSettings {
    pub fn new(jail: Jail) -> Self {
        Self {
            jail,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }
}

#[derive(Clone)]
struct Peer {
    session_id: SessionId,
    outbound: Outbound,
}

/// A worker's control channel, as seen by the client it serves.
pub struct WorkerLink {
    worker_id: String,
    pid: i32,
    outbound: Outbound,
    peer: StdMutex<Option<Peer>>,
}

impl WorkerLink {
    pub fn new(worker_id: impl Into<String>, pid: i32, outbound: Outbound) -> Self {
        Self {
            worker_id: worker_id.into(),
            pid,
            outbound,
            peer: StdMutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Forward a client message to the worker.
    pub async fn send(&self, data: &[u8]) -> Result<(), SessionError> {
        self.outbound.send_data(data).await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.outbound.send_text(text).await
    }

    /// Outbound side of the client this worker is paired with.
    pub fn peer(&self) -> Option<(SessionId, Outbound)> {
        lock(&self.peer)
            .as_ref()
            .map(|p| (p.session_id, p.outbound.clone()))
    }

    pub fn is_paired(&self) -> bool {
        lock(&self.peer).is_some()
    }

    fn pair(&self, session_id: SessionId, outbound: Outbound) {
        *lock(&self.peer) = Some(Peer {
            session_id,
            outbound,
        });
    }

    /// Drop the pairing, returning the client's outbound if there was one.
    pub fn unpair(&self) -> Option<(SessionId, Outbound)> {
        lock(&self.peer)
            .take()
            .map(|p| (p.session_id, p.outbound))
    }

    fn is_gone(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl std::fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLink")
            .field("worker_id", &self.worker_id)
            .field("pid", &self.pid)
            .field("paired", &self.is_paired())
            .finish()
    }
}

/// State shared by every connection: session identities, the jail root, the
/// pool of idle workers, and the control pipe to the broker process.
pub struct SessionBroker {
    ids: SessionIds,
    jail: Jail,
    tracked: TrackedView,
    claim_timeout: Duration,
    available: StdMutex<VecDeque<Arc<WorkerLink>>>,
    worker_ready: Notify,
    broker_pipe: StdMutex<Option<BrokerPipe>>,
}

impl SessionBroker {
    pub fn new(settings: BrokerSettings, tracked: TrackedView) -> Self {
        Self {
            ids: SessionIds::new(),
            jail: settings.jail,
            tracked,
            claim_timeout: settings.claim_timeout,
            available: StdMutex::new(VecDeque::new()),
            worker_ready: Notify::new(),
            broker_pipe: StdMutex::new(None),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.ids.next_id()
    }

    pub fn jail(&self) -> &Jail {
        &self.jail
    }

    pub fn set_broker_pipe(&self, pipe: BrokerPipe) {
        *lock(&self.broker_pipe) = Some(pipe);
    }

    /// Remove the broker pipe so the broker sees end-of-file.
    pub fn take_broker_pipe(&self) -> Option<BrokerPipe> {
        lock(&self.broker_pipe).take()
    }

    pub fn available_workers(&self) -> usize {
        lock(&self.available).len()
    }

    /// Admit a worker that has said hello into the available pool.
    ///
    /// Only processes we spawned, or direct children of them, are accepted.
    pub fn register_worker(&self, link: Arc<WorkerLink>) -> Result<(), SessionError> {
        if !self.tracked.is_tracked_lineage(link.pid()) {
            return Err(SessionError::UnknownWorker { pid: link.pid() });
        }

        tracing::info!(
            worker_id = %link.worker_id(),
            pid = link.pid(),
            "Worker available"
        );
        lock(&self.available).push_back(link);
        self.worker_ready.notify_waiters();
        Ok(())
    }

    pub fn remove_worker(&self, link: &Arc<WorkerLink>) {
        let mut available = lock(&self.available);
        let before = available.len();
        available.retain(|l| !Arc::ptr_eq(l, link));
        if available.len() != before {
            tracing::debug!(worker_id = %link.worker_id(), "Worker left the available pool");
        }
    }

    /// Take an idle worker for a client session, waiting up to the claim
    /// timeout. Asks the broker for a replacement once a worker is taken.
    pub async fn claim_worker(
        &self,
        session_id: SessionId,
        outbound: Outbound,
    ) -> Option<Arc<WorkerLink>> {
        let deadline = Instant::now() + self.claim_timeout;
        loop {
            let ready = self.worker_ready.notified();
            if let Some(link) = self.pop_available() {
                link.pair(session_id, outbound);
                tracing::info!(
                    session_id = %session_id,
                    worker_id = %link.worker_id(),
                    pid = link.pid(),
                    "Session paired with worker"
                );
                self.request_spawn();
                return Some(link);
            }

            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                tracing::warn!(session_id = %session_id, "No worker became available");
                return None;
            }
        }
    }

    fn pop_available(&self) -> Option<Arc<WorkerLink>> {
        let mut available = lock(&self.available);
        while let Some(link) = available.pop_front() {
            if !link.is_gone() {
                return Some(link);
            }
        }
        None
    }

    fn request_spawn(&self) {
        let mut pipe = lock(&self.broker_pipe);
        match pipe.as_mut() {
            Some(pipe) => {
                if let Err(e) = pipe.write_line(SPAWN_REQUEST) {
                    tracing::warn!(
                        fifo = %pipe.path().display(),
                        error = %e,
                        "Failed to ask broker for a new worker"
                    );
                }
            }
            None => tracing::debug!("No broker pipe, not requesting a new worker"),
        }
    }
}
