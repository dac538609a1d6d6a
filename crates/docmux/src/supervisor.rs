//! Process supervisor - spawns the broker, tracks children, reaps exits.
//!
//! The tracked set is the single record of which processes we started and
//! still consider alive. Only the supervisor mutates it; connection handlers
//! get a read-only [`TrackedView`] to validate worker hellos.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fatal::ConsumerFault;

/// Non-blocking polls without a reap before the loop sleeps.
pub const DEFAULT_POLL_BATCH: u32 = 10;

/// Sleep between poll batches.
pub const DEFAULT_MAINTENANCE_SLEEP: Duration = Duration::from_secs(2);

/// A process the supervisor started.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: i32,
    pub label: String,
    pub spawned_at: Instant,
}

/// Live processes we spawned, keyed by pid.
#[derive(Debug, Clone, Default)]
pub struct TrackedSet {
    inner: Arc<DashMap<i32, TrackedProcess>>,
}

impl TrackedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, pid: i32, label: impl Into<String>) {
        self.inner.insert(
            pid,
            TrackedProcess {
                pid,
                label: label.into(),
                spawned_at: Instant::now(),
            },
        );
    }

    pub fn untrack(&self, pid: i32) -> Option<TrackedProcess> {
        self.inner.remove(&pid).map(|(_, p)| p)
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.inner.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.inner.iter().map(|e| *e.key()).collect();
        pids.sort_unstable();
        pids
    }

    pub fn view(&self) -> TrackedView {
        TrackedView {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only handle on a [`TrackedSet`].
#[derive(Debug, Clone)]
pub struct TrackedView {
    inner: Arc<DashMap<i32, TrackedProcess>>,
}

impl TrackedView {
    pub fn contains(&self, pid: i32) -> bool {
        self.inner.contains_key(&pid)
    }

    /// True for a tracked pid or a direct child of one. Workers are forked
    /// by the broker, so their parent is the tracked process.
    pub fn is_tracked_lineage(&self, pid: i32) -> bool {
        self.contains(pid) || parent_pid(pid).is_some_and(|ppid| self.contains(ppid))
    }
}

/// Parent pid from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn parent_pid(pid: i32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn parent_pid(_pid: i32) -> Option<i32> {
    None
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for how the broker process is started.
pub trait BrokerSpawner: Send + Sync {
    /// Start the broker and return its pid. The child must not be waited on
    /// by the spawner; the supervisor reaps it.
    fn spawn(&self, args: &[String]) -> Result<i32, SpawnError>;
}

/// Runs the broker executable.
pub struct BrokerCommand {
    program: PathBuf,
}

impl BrokerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl BrokerSpawner for BrokerCommand {
    fn spawn(&self, args: &[String]) -> Result<i32, SpawnError> {
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()?;
        i32::try_from(child.id())
            .map_err(|_| SpawnError::Other(format!("pid {} out of range", child.id())))
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub broker: PathBuf,
    pub lo_subpath: String,
    pub sys_template: PathBuf,
    pub lo_template: PathBuf,
    pub child_root: PathBuf,
    pub num_prespawns: usize,
    pub client_port: u16,
    /// Debug builds only: uid the broker should assume.
    pub uid: Option<u32>,
    pub poll_batch: u32,
    pub maintenance_sleep: Duration,
}

impl SupervisorConfig {
    /// Command line for the broker, carrying the shared configuration.
    pub fn broker_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--losubpath={}", self.lo_subpath),
            format!("--systemplate={}", self.sys_template.display()),
            format!("--lotemplate={}", self.lo_template.display()),
            format!("--childroot={}", self.child_root.display()),
            format!("--numprespawns={}", self.num_prespawns),
            format!("--clientport={}", self.client_port),
        ];
        if let Some(uid) = self.uid {
            args.push(format!("--uid={uid}"));
        }
        args
    }
}

/// A state change of a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    Exited {
        pid: i32,
        code: i32,
    },
    Signaled {
        pid: i32,
        signal: Signal,
        core_dumped: bool,
    },
    Stopped {
        pid: i32,
        signal: Signal,
    },
    Continued {
        pid: i32,
    },
}

impl ChildEvent {
    pub fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Self::Exited {
                pid: pid.as_raw(),
                code,
            }),
            WaitStatus::Signaled(pid, signal, core_dumped) => Some(Self::Signaled {
                pid: pid.as_raw(),
                signal,
                core_dumped,
            }),
            WaitStatus::Stopped(pid, signal) => Some(Self::Stopped {
                pid: pid.as_raw(),
                signal,
            }),
            WaitStatus::Continued(pid) => Some(Self::Continued { pid: pid.as_raw() }),
            _ => None,
        }
    }

    pub fn pid(&self) -> i32 {
        match *self {
            Self::Exited { pid, .. }
            | Self::Signaled { pid, .. }
            | Self::Stopped { pid, .. }
            | Self::Continued { pid } => pid,
        }
    }

    /// Exit conditions remove the pid from the tracked set.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Signaled { .. })
    }
}

/// Why the supervise loop returned.
#[derive(Debug)]
pub enum SuperviseExit {
    Terminated,
    NoWorkers,
    Fatal(ConsumerFault),
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    spawner: Arc<dyn BrokerSpawner>,
    tracked: TrackedSet,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, spawner: Arc<dyn BrokerSpawner>) -> Self {
        Self {
            config,
            spawner,
            tracked: TrackedSet::new(),
        }
    }

    pub fn tracked(&self) -> &TrackedSet {
        &self.tracked
    }

    pub fn tracked_view(&self) -> TrackedView {
        self.tracked.view()
    }

    /// Launch the broker and track it. Failure is logged, not fatal.
    pub fn spawn_broker(&self) -> Option<i32> {
        let args = self.config.broker_args();
        match self.spawner.spawn(&args) {
            Ok(pid) => {
                tracing::info!(
                    pid,
                    broker = %self.config.broker.display(),
                    args = %args.join(" "),
                    "Spawned broker"
                );
                self.tracked.track(pid, "broker");
                Some(pid)
            }
            Err(e) => {
                tracing::error!(
                    broker = %self.config.broker.display(),
                    error = %e,
                    "Failed to spawn broker"
                );
                None
            }
        }
    }

    /// One non-blocking wait for any child.
    pub fn reap_once(&self) -> Result<Option<ChildEvent>, Errno> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let status = waitpid(Pid::from_raw(-1), Some(flags))?;
        Ok(ChildEvent::from_status(status))
    }

    /// Log a child state change and drop exited pids from the tracked set.
    /// Returns whether the pid was tracked.
    pub fn handle_event(&self, event: ChildEvent) -> bool {
        let pid = event.pid();
        if !self.tracked.contains(pid) {
            tracing::warn!(pid, ?event, "Reaped a process we are not tracking");
            return false;
        }

        match event {
            ChildEvent::Exited { code, .. } => {
                tracing::info!(pid, code, "Child process exited");
            }
            ChildEvent::Signaled {
                signal,
                core_dumped,
                ..
            } => {
                tracing::warn!(pid, signal = %signal, "Child process killed by signal");
                if core_dumped {
                    tracing::warn!(pid, "Child process dumped core");
                }
            }
            ChildEvent::Stopped { signal, .. } => {
                tracing::info!(pid, signal = %signal, "Child process stopped");
            }
            ChildEvent::Continued { .. } => {
                tracing::info!(pid, "Child process continued");
            }
        }

        if event.is_terminal()
            && let Some(process) = self.tracked.untrack(pid)
        {
            tracing::info!(
                pid = process.pid,
                label = %process.label,
                uptime_secs = process.spawned_at.elapsed().as_secs(),
                remaining = self.tracked.len(),
                "Stopped tracking child"
            );
        }
        true
    }

    /// Reap children until termination, a consumer fault, or no tracked
    /// process is left.
    pub async fn supervise(
        &self,
        termination: &CancellationToken,
        faults: &mut mpsc::UnboundedReceiver<ConsumerFault>,
    ) -> SuperviseExit {
        let mut idle_polls = 0;
        loop {
            if termination.is_cancelled() {
                return SuperviseExit::Terminated;
            }
            if let Ok(fault) = faults.try_recv() {
                termination.cancel();
                return SuperviseExit::Fatal(fault);
            }
            if self.tracked.is_empty() {
                tracing::warn!("No tracked processes left");
                return SuperviseExit::NoWorkers;
            }

            match self.reap_once() {
                Ok(Some(event)) => {
                    self.handle_event(event);
                    idle_polls = 0;
                    continue;
                }
                Ok(None) => {}
                Err(Errno::ECHILD) => tracing::trace!("No children to reap"),
                Err(e) => tracing::warn!(error = %e, "waitpid failed"),
            }

            idle_polls += 1;
            if idle_polls >= self.config.poll_batch {
                idle_polls = 0;
                tokio::select! {
                    _ = termination.cancelled() => {}
                    Some(fault) = faults.recv() => {
                        termination.cancel();
                        return SuperviseExit::Fatal(fault);
                    }
                    _ = tokio::time::sleep(self.config.maintenance_sleep) => {}
                }
            }
        }
    }

    /// Send SIGTERM to every tracked process. Returns how many were signalled.
    pub fn request_termination(&self) -> usize {
        let mut signalled = 0;
        for pid in self.tracked.pids() {
            tracing::info!(pid, "Requesting termination");
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => signalled += 1,
                Err(e) => tracing::warn!(pid, error = %e, "Cannot signal child"),
            }
        }
        signalled
    }

    /// Block until every tracked process has exited.
    pub async fn wait_for_exit(&self) {
        let tracked = self.tracked.clone();
        let waited = tokio::task::spawn_blocking(move || {
            for pid in tracked.pids() {
                match waitpid(Pid::from_raw(pid), None) {
                    Ok(status) => {
                        tracing::info!(pid, ?status, "Child process finished");
                    }
                    Err(e) => tracing::debug!(pid, error = %e, "Nothing to wait for"),
                }
                tracked.untrack(pid);
            }
        })
        .await;
        if let Err(e) = waited {
            tracing::error!(error = %e, "Final wait failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Mutex;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            broker: PathBuf::from("/usr/bin/docmux-broker"),
            lo_subpath: "lo".into(),
            sys_template: PathBuf::from("/srv/systemplate"),
            lo_template: PathBuf::from("/opt/lo"),
            child_root: PathBuf::from("/srv/jails/"),
            num_prespawns: 10,
            client_port: 9980,
            uid: None,
            poll_batch: 2,
            maintenance_sleep: Duration::from_millis(10),
        }
    }

    /// Records arguments and hands out fake pids.
    struct FakeSpawner {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl BrokerSpawner for FakeSpawner {
        fn spawn(&self, args: &[String]) -> Result<i32, SpawnError> {
            self.calls.lock().unwrap().push(args.to_vec());
            if self.fail {
                Err(SpawnError::Other("no broker".into()))
            } else {
                Ok(4_000_001)
            }
        }
    }

    fn supervisor(fail: bool) -> (ProcessSupervisor, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner {
            calls: Mutex::new(Vec::new()),
            fail,
        });
        (
            ProcessSupervisor::new(config(), Arc::clone(&spawner) as Arc<dyn BrokerSpawner>),
            spawner,
        )
    }

    #[test]
    fn broker_args_carry_shared_configuration() {
        let mut config = config();
        config.uid = Some(1000);
        insta::assert_snapshot!(config.broker_args().join("\n"), @r"
        --losubpath=lo
        --systemplate=/srv/systemplate
        --lotemplate=/opt/lo
        --childroot=/srv/jails/
        --numprespawns=10
        --clientport=9980
        --uid=1000
        ");
    }

    #[test]
    fn spawn_tracks_pid() {
        let (supervisor, spawner) = supervisor(false);
        assert_eq!(supervisor.spawn_broker(), Some(4_000_001));
        assert!(supervisor.tracked().contains(4_000_001));
        assert_eq!(spawner.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn spawn_failure_is_not_fatal() {
        let (supervisor, _) = supervisor(true);
        assert_eq!(supervisor.spawn_broker(), None);
        assert!(supervisor.tracked().is_empty());
    }

    #[test]
    fn exit_is_removed_exactly_once() {
        let (supervisor, _) = supervisor(false);
        supervisor.tracked().track(42, "worker");
        supervisor.tracked().track(43, "worker");

        let exited = ChildEvent::Exited { pid: 42, code: 0 };
        assert!(supervisor.handle_event(exited));
        assert!(!supervisor.tracked().contains(42));
        assert!(!supervisor.handle_event(exited));
        assert_eq!(supervisor.tracked().pids(), vec![43]);
    }

    #[test]
    fn untrack_returns_the_spawn_record() {
        let tracked = TrackedSet::new();
        tracked.track(42, "broker");

        let process = tracked.untrack(42).unwrap();
        assert_eq!(process.pid, 42);
        assert_eq!(process.label, "broker");
        assert!(process.spawned_at.elapsed() < Duration::from_secs(60));
        assert!(tracked.untrack(42).is_none());
    }

    #[test]
    fn stop_and_continue_keep_the_pid() {
        let (supervisor, _) = supervisor(false);
        supervisor.tracked().track(42, "worker");

        supervisor.handle_event(ChildEvent::Stopped {
            pid: 42,
            signal: Signal::SIGSTOP,
        });
        supervisor.handle_event(ChildEvent::Continued { pid: 42 });
        assert!(supervisor.tracked().contains(42));

        supervisor.handle_event(ChildEvent::Signaled {
            pid: 42,
            signal: Signal::SIGSEGV,
            core_dumped: true,
        });
        assert!(supervisor.tracked().is_empty());
    }

    #[test]
    fn classifies_wait_statuses() {
        let pid = Pid::from_raw(7);
        assert_eq!(
            ChildEvent::from_status(WaitStatus::Exited(pid, 3)),
            Some(ChildEvent::Exited { pid: 7, code: 3 })
        );
        assert!(ChildEvent::from_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false))
            .is_some_and(|e| e.is_terminal()));
        assert!(ChildEvent::from_status(WaitStatus::Stopped(pid, Signal::SIGTSTP))
            .is_some_and(|e| !e.is_terminal()));
        assert_eq!(ChildEvent::from_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn own_process_is_tracked_lineage_of_parent() {
        let tracked = TrackedSet::new();
        let view = tracked.view();
        let own = std::process::id() as i32;
        assert!(!view.is_tracked_lineage(own));

        tracked.track(own, "self");
        assert!(view.is_tracked_lineage(own));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_of_tracked_process_is_accepted() {
        let tracked = TrackedSet::new();
        let own = std::process::id() as i32;
        let parent = nix::unistd::getppid().as_raw();
        tracked.track(parent, "parent");
        assert!(tracked.view().is_tracked_lineage(own));
    }

    #[tokio::test]
    async fn supervise_returns_when_nothing_is_tracked() {
        let (supervisor, _) = supervisor(true);
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let exit = supervisor.supervise(&CancellationToken::new(), &mut rx).await;
        assert!(matches!(exit, SuperviseExit::NoWorkers));
    }

    #[tokio::test]
    async fn supervise_honours_termination() {
        let (supervisor, _) = supervisor(false);
        supervisor.tracked().track(4_000_002, "phantom");
        let token = CancellationToken::new();
        token.cancel();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        assert!(matches!(
            supervisor.supervise(&token, &mut rx).await,
            SuperviseExit::Terminated
        ));
    }

    #[tokio::test]
    async fn supervise_escalates_consumer_faults() {
        let (supervisor, _) = supervisor(false);
        supervisor.tracked().track(4_000_003, "phantom");
        let token = CancellationToken::new();
        let (reporter, mut rx) = crate::fatal::FatalReporter::channel();
        reporter.report(ConsumerFault {
            session_id: crate::session::SessionIds::new().next_id(),
            reason: "boom".into(),
        });

        assert!(matches!(
            supervisor.supervise(&token, &mut rx).await,
            SuperviseExit::Fatal(_)
        ));
        assert!(token.is_cancelled());
    }

    /// Starts a real `sleep` regardless of the broker arguments.
    struct SleepSpawner;

    impl BrokerSpawner for SleepSpawner {
        fn spawn(&self, _args: &[String]) -> Result<i32, SpawnError> {
            let child = Command::new("sleep").arg("30").stdin(Stdio::null()).spawn()?;
            Ok(child.id() as i32)
        }
    }

    #[tokio::test]
    #[serial]
    async fn reaps_killed_child_and_keeps_the_other() {
        let supervisor = ProcessSupervisor::new(config(), Arc::new(SleepSpawner));
        let first = supervisor.spawn_broker().unwrap();
        let second = supervisor.spawn_broker().unwrap();
        assert_eq!(supervisor.tracked().len(), 2);

        kill(Pid::from_raw(first), Signal::SIGKILL).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match supervisor.reap_once().unwrap() {
                Some(event) if event.pid() == first => {
                    assert!(matches!(
                        event,
                        ChildEvent::Signaled {
                            signal: Signal::SIGKILL,
                            ..
                        }
                    ));
                    assert!(supervisor.handle_event(event));
                    break;
                }
                Some(event) => {
                    supervisor.handle_event(event);
                }
                None => {
                    assert!(tokio::time::Instant::now() < deadline, "child was never reaped");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        assert_eq!(supervisor.tracked().pids(), vec![second]);

        assert_eq!(supervisor.request_termination(), 1);
        supervisor.wait_for_exit().await;
        assert!(supervisor.tracked().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn supervise_ends_once_the_last_child_exits() {
        let supervisor = ProcessSupervisor::new(config(), Arc::new(SleepSpawner));
        let pid = supervisor.spawn_broker().unwrap();
        kill(Pid::from_raw(pid), Signal::SIGTERM).unwrap();

        let (_tx, mut rx) = mpsc::unbounded_channel();
        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.supervise(&CancellationToken::new(), &mut rx),
        )
        .await
        .unwrap();
        assert!(matches!(exit, SuperviseExit::NoWorkers));
    }
}
