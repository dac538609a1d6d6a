//! Fail-fast reporting from per-session queue consumers.
//!
//! A consumer that faults cannot be resumed safely. It reports here and the
//! supervisor turns the first report into a process-wide shutdown.

use tokio::sync::mpsc;

use crate::session::SessionId;

/// A queue consumer stopped abnormally.
#[derive(Debug, thiserror::Error)]
#[error("queue consumer for session {session_id} faulted: {reason}")]
pub struct ConsumerFault {
    pub session_id: SessionId,
    pub reason: String,
}

/// Cloneable sender side of the fatal channel.
#[derive(Debug, Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<ConsumerFault>,
}

impl FatalReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConsumerFault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, fault: ConsumerFault) {
        tracing::error!(
            session_id = %fault.session_id,
            reason = %fault.reason,
            "Queue consumer fault"
        );
        if self.tx.send(fault).is_err() {
            tracing::error!("Nobody is listening for consumer faults");
        }
    }
}
