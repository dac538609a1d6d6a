//! Process-local files: PID file, startup lock, broker FIFO.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{AccessFlags, access, mkfifo};
use tokio_util::sync::CancellationToken;

pub const PID_FILE: &str = "/tmp/docmux.pid";
pub const LOCK_FILE: &str = "/tmp/docmux.lock";
pub const BROKER_FIFO: &str = "/tmp/docmuxfifo";

/// Retry interval while waiting for the broker to open the FIFO for reading.
const FIFO_OPEN_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cache directory {path} is not accessible: {source}")]
    CacheDir { path: PathBuf, source: Errno },
    #[error("cannot create fifo {path}: {source}")]
    Fifo { path: PathBuf, source: Errno },
    #[error("cannot write pid file {path}: {source}")]
    PidFile { path: PathBuf, source: io::Error },
    #[error("cannot take lock {path}: {source}")]
    Lock { path: PathBuf, source: io::Error },
    #[error("cannot open fifo {path}: {source}")]
    FifoOpen { path: PathBuf, source: io::Error },
    #[error("termination requested while waiting for the broker")]
    Terminated,
}

/// The cache directory must be readable, writable, and searchable.
pub fn check_cache_dir(path: &Path) -> Result<(), StartupError> {
    access(path, AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK).map_err(|source| {
        StartupError::CacheDir {
            path: path.to_path_buf(),
            source,
        }
    })
}

pub fn write_pid_file(path: &Path) -> Result<(), StartupError> {
    std::fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
        StartupError::PidFile {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Create the FIFO unless it already exists.
pub fn ensure_fifo(path: &Path) -> Result<(), StartupError> {
    match mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Created broker fifo");
            Ok(())
        }
        Err(Errno::EEXIST) => Ok(()),
        Err(source) => Err(StartupError::Fifo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Exclusive cross-process lock held while the broker starts up.
#[derive(Debug)]
pub struct StartupLock {
    file: File,
    path: PathBuf,
}

impl StartupLock {
    pub fn acquire(path: &Path) -> Result<Self, StartupError> {
        let lock_err = |source| StartupError::Lock {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        tracing::debug!(path = %path.display(), "Startup lock taken");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Like [`StartupLock::acquire`], but waits for the lock on the blocking
    /// pool so a holder in another process does not stall the runtime.
    pub async fn acquire_async(path: &Path) -> Result<Self, StartupError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire(&owned))
            .await
            .map_err(|e| StartupError::Lock {
                path: path.to_path_buf(),
                source: io::Error::other(e),
            })?
    }

    pub fn release(self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to release startup lock"
            );
        }
    }
}

/// Write end of the control FIFO read by the broker.
#[derive(Debug)]
pub struct BrokerPipe {
    file: File,
    path: PathBuf,
}

impl BrokerPipe {
    pub fn from_file(path: &Path, file: File) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
        }
    }

    /// Open the FIFO for writing once a reader exists.
    ///
    /// Non-blocking opens fail with `ENXIO` until the broker opens its end,
    /// so this polls, giving up when termination is requested.
    pub async fn open_when_ready(
        path: &Path,
        termination: &CancellationToken,
    ) -> Result<Self, StartupError> {
        loop {
            let opened = OpenOptions::new()
                .write(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(path);
            match opened {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "Broker fifo open");
                    return Ok(Self::from_file(path, file));
                }
                Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {}
                Err(source) => {
                    return Err(StartupError::FifoOpen {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }

            tokio::select! {
                _ = termination.cancelled() => return Err(StartupError::Terminated),
                _ = tokio::time::sleep(FIFO_OPEN_RETRY) => {}
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.file.write_all(format!("{line}\n").as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_holds_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docmux.pid");
        write_pid_file(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            format!("{}\n", std::process::id())
        );
    }

    #[test]
    fn missing_cache_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_cache_dir(dir.path()).is_ok());
        assert!(matches!(
            check_cache_dir(&dir.path().join("missing")),
            Err(StartupError::CacheDir { .. })
        ));
    }

    #[test]
    fn ensure_fifo_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        ensure_fifo(&path).unwrap();
        ensure_fifo(&path).unwrap();

        use std::os::unix::fs::FileTypeExt;
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn lock_can_be_retaken_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docmux.lock");
        StartupLock::acquire(&path).unwrap().release();
        StartupLock::acquire(&path).unwrap().release();
    }

    #[tokio::test]
    async fn fifo_opens_once_a_reader_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        ensure_fifo(&path).unwrap();

        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            std::fs::read_to_string(reader_path).unwrap()
        });

        let mut pipe = BrokerPipe::open_when_ready(&path, &CancellationToken::new())
            .await
            .unwrap();
        pipe.write_line("spawn 1").unwrap();
        drop(pipe);

        assert_eq!(reader.join().unwrap(), "spawn 1\n");
    }

    #[tokio::test]
    async fn fifo_wait_stops_on_termination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        ensure_fifo(&path).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            BrokerPipe::open_when_ready(&path, &token).await,
            Err(StartupError::Terminated)
        ));
    }

    #[tokio::test]
    async fn contended_lock_does_not_block_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docmux.lock");
        let held = StartupLock::acquire(&path).unwrap();

        let waiter = {
            let path = path.clone();
            tokio::spawn(async move { StartupLock::acquire_async(&path).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        held.release();
        let lock = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        lock.release();
    }
}
