//! The master process: startup, supervision, ordered shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MasterConfig;
use crate::connection::ConnectionContext;
use crate::fatal::{ConsumerFault, FatalReporter};
use crate::interactive::run_client;
use crate::jail::Jail;
use crate::session::{BrokerSettings, SessionBroker};
use crate::startup::{
    BrokerPipe, StartupError, StartupLock, check_cache_dir, ensure_fifo, write_pid_file,
};
use crate::supervisor::{BrokerSpawner, ProcessSupervisor, SuperviseExit};
use crate::transport::http::install_signal_handlers;
use crate::transport::ListenerPair;

/// Process exit statuses (sysexits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok,
    Usage,
    Unavailable,
    Software,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Usage => 64,
            Self::Unavailable => 69,
            Self::Software => 70,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

/// Run the master until termination or until no worker process is left.
pub async fn serve(
    config: MasterConfig,
    spawner: Arc<dyn BrokerSpawner>,
    termination: CancellationToken,
) -> anyhow::Result<ExitStatus> {
    if let Err(e) = check_cache_dir(&config.cache_dir) {
        error!(error = %e, "Cache directory unusable");
        return Ok(ExitStatus::Unavailable);
    }
    if let Err(e) = write_pid_file(&config.pid_file) {
        warn!(error = %e, "Continuing without a pid file");
    }
    if let Err(e) = ensure_fifo(&config.fifo) {
        error!(error = %e, "Cannot create broker fifo");
        return Ok(ExitStatus::Unavailable);
    }

    let _signals = install_signal_handlers(termination.clone())
        .context("failed to install signal handlers")?;

    let lock = StartupLock::acquire_async(&config.lock_file)
        .await
        .inspect_err(|e| warn!(error = %e, "Starting without the startup lock"))
        .ok();

    let supervisor = ProcessSupervisor::new(config.supervisor.clone(), spawner);
    supervisor.spawn_broker();

    let jail = Jail::new(&config.child_root);
    let broker = Arc::new(SessionBroker::new(
        BrokerSettings::new(jail.clone()),
        supervisor.tracked_view(),
    ));
    let (fatal, mut faults) = FatalReporter::channel();
    let ctx = ConnectionContext {
        broker: Arc::clone(&broker),
        fatal,
        termination: termination.clone(),
        settings: config.connection.clone(),
    };

    let listeners = match ListenerPair::start(&config.server, ctx).await {
        Ok(listeners) => listeners,
        Err(e) => {
            error!(error = %e, "Cannot start listeners");
            termination.cancel();
            if let Some(lock) = lock {
                lock.release();
            }
            terminate_children(&supervisor, &jail).await;
            return Ok(ExitStatus::Unavailable);
        }
    };

    let pipe_task = tokio::spawn(connect_broker_pipe(
        config.fifo.clone(),
        Arc::clone(&broker),
        lock,
        termination.clone(),
    ));

    let status = if config.test_mode {
        let stdin = BufReader::new(tokio::io::stdin());
        let status =
            run_interactive(listeners.client_addr(), stdin, &termination, &mut faults).await;
        listeners.stop();
        termination.cancel();
        status
    } else {
        match supervisor.supervise(&termination, &mut faults).await {
            SuperviseExit::Terminated => ExitStatus::Ok,
            SuperviseExit::NoWorkers => {
                warn!("No worker processes left, shutting down");
                ExitStatus::Ok
            }
            SuperviseExit::Fatal(fault) => {
                error!(error = %fault, "Shutting down after a queue consumer fault");
                ExitStatus::Software
            }
        }
    };

    info!("Stopping listeners");
    termination.cancel();
    let _ = pipe_task.await;
    drop(broker.take_broker_pipe());
    listeners.stop();
    listeners.join().await;

    terminate_children(&supervisor, &jail).await;
    info!(status = status.code(), "Master exiting");
    Ok(status)
}

/// Drive the interactive client until its input ends. A queue consumer fault
/// still ends the process, as it does under supervision.
async fn run_interactive<R>(
    client_addr: SocketAddr,
    input: R,
    termination: &CancellationToken,
    faults: &mut mpsc::UnboundedReceiver<ConsumerFault>,
) -> ExitStatus
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        biased;
        Some(fault) = faults.recv() => {
            error!(error = %fault, "Shutting down after a queue consumer fault");
            termination.cancel();
            ExitStatus::Software
        }
        result = run_client(client_addr, input, termination) => {
            if let Err(e) = result {
                error!(error = %e, "Interactive session failed");
            }
            ExitStatus::Ok
        }
    }
}

/// Open the broker fifo once the broker reads it, then release the startup lock.
async fn connect_broker_pipe(
    fifo: PathBuf,
    broker: Arc<SessionBroker>,
    lock: Option<StartupLock>,
    termination: CancellationToken,
) {
    match BrokerPipe::open_when_ready(&fifo, &termination).await {
        Ok(pipe) => broker.set_broker_pipe(pipe),
        Err(StartupError::Terminated) => {}
        Err(e) => error!(error = %e, "Broker fifo unavailable"),
    }
    if let Some(lock) = lock {
        lock.release();
    }
}

async fn terminate_children(supervisor: &ProcessSupervisor, jail: &Jail) {
    let signalled = supervisor.request_termination();
    info!(signalled, "Waiting for child processes");
    supervisor.wait_for_exit().await;
    let removed = jail.clean_all();
    info!(removed, "Removed jails");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionIds;
    use tokio::net::TcpListener;

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn interactive_mode_fails_fast_on_consumer_fault() {
        let (reporter, mut faults) = FatalReporter::channel();
        reporter.report(ConsumerFault {
            session_id: SessionIds::new().next_id(),
            reason: "boom".into(),
        });
        let termination = CancellationToken::new();

        let status =
            run_interactive(unused_addr().await, &b""[..], &termination, &mut faults).await;
        assert_eq!(status, ExitStatus::Software);
        assert!(termination.is_cancelled());
    }

    #[tokio::test]
    async fn interactive_mode_ends_cleanly_without_faults() {
        let (_reporter, mut faults) = FatalReporter::channel();
        let termination = CancellationToken::new();

        let status =
            run_interactive(unused_addr().await, &b""[..], &termination, &mut faults).await;
        assert_eq!(status, ExitStatus::Ok);
    }

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(ExitStatus::Ok.code(), 0);
        assert_eq!(ExitStatus::Usage.code(), 64);
        assert_eq!(ExitStatus::Unavailable.code(), 69);
        assert_eq!(ExitStatus::Software.code(), 70);
    }
}
