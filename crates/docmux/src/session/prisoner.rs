use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;

use super::broker::{SessionBroker, WorkerLink};
use super::{Kind, Outbound, Session, SessionError, SessionId};
use crate::jail::safe_component;
use crate::protocol::{first_line, tokenize};

const HELLO_COMMAND: &str = "child";

/// Close code for a worker connection that failed to identify itself.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Session facing a worker process ("prisoner").
///
/// The first message must be `child <worker-id> <pid>`. After that, every
/// message is output for the paired client and is forwarded verbatim.
pub struct PrisonerSession {
    outbound: Outbound,
    broker: Arc<SessionBroker>,
    link: StdMutex<Option<Arc<WorkerLink>>>,
}

impl PrisonerSession {
    pub fn new(broker: Arc<SessionBroker>, outbound: Outbound) -> Self {
        Self {
            outbound,
            broker,
            link: StdMutex::new(None),
        }
    }

    fn current_link(&self) -> Option<Arc<WorkerLink>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn hello(&self, data: &[u8]) -> Result<bool, SessionError> {
        let line = first_line(data);
        let identity = match tokenize(&line).as_slice() {
            [cmd, worker_id, pid] if *cmd == HELLO_COMMAND => safe_component(worker_id)
                .ok()
                .zip(pid.parse::<i32>().ok().filter(|&p| p > 0))
                .map(|(id, pid)| (id.to_string(), pid)),
            _ => None,
        };

        let Some((worker_id, pid)) = identity else {
            tracing::warn!(line = %line, "Worker sent an invalid hello");
            self.reject("invalid hello").await;
            return Ok(false);
        };

        let link = Arc::new(WorkerLink::new(worker_id, pid, self.outbound.clone()));
        match self.broker.register_worker(Arc::clone(&link)) {
            Ok(()) => {
                *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(worker_id = %link.worker_id(), pid, error = %e, "Rejecting worker");
                self.reject("unknown worker").await;
                Ok(false)
            }
        }
    }

    async fn reject(&self, reason: &str) {
        if let Err(e) = self.outbound.close(CLOSE_POLICY_VIOLATION, reason).await {
            tracing::debug!(error = %e, "Worker connection already closed");
        }
    }
}

#[async_trait]
impl Session for PrisonerSession {
    fn kind(&self) -> Kind {
        Kind::ToPrisoner
    }

    fn id(&self) -> Option<SessionId> {
        None
    }

    async fn handle_input(&self, data: &[u8]) -> Result<bool, SessionError> {
        let Some(link) = self.current_link() else {
            return self.hello(data).await;
        };

        match link.peer() {
            Some((session_id, client)) => {
                if client.send_data(data).await.is_err() {
                    tracing::debug!(
                        session_id = %session_id,
                        worker_id = %link.worker_id(),
                        "Client gone, dropping worker output"
                    );
                }
            }
            None => tracing::debug!(
                worker_id = %link.worker_id(),
                "Dropping output from unpaired worker"
            ),
        }
        Ok(true)
    }

    async fn close(&self) {
        let link = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(link) = link else {
            return;
        };

        self.broker.remove_worker(&link);
        tracing::info!(worker_id = %link.worker_id(), pid = link.pid(), "Worker connection ended");

        if let Some((session_id, client)) = link.unpair() {
            tracing::warn!(
                session_id = %session_id,
                worker_id = %link.worker_id(),
                "Paired worker died"
            );
            let _ = client
                .send_text("error: cmd=internal kind=workerdied")
                .await;
        }
    }
}
