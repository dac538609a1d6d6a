//! Command line options and the configuration derived from them.

use std::path::PathBuf;

use clap::Parser;

use crate::connection::ConnectionSettings;
use crate::frame::DEFAULT_MAX_LARGE_MESSAGE;
use crate::startup::{BROKER_FIFO, LOCK_FILE, PID_FILE};
use crate::supervisor::{DEFAULT_MAINTENANCE_SLEEP, DEFAULT_POLL_BATCH, SupervisorConfig};
use crate::transport::http::{DEFAULT_CLIENT_PORT, MIN_POOL_CAPACITY, WORKER_PORT};
use crate::transport::ServerConfig;

pub const DEFAULT_CACHE_DIR: &str = "/var/cache/docmux";

/// Broker executable looked up next to our own binary.
const BROKER_BINARY: &str = "docmux-broker";

/// Handlers per listener for each pre-spawned worker.
const HANDLERS_PER_PRESPAWN: usize = 5;

#[derive(Parser, Debug, Clone)]
#[command(name = "docmux")]
#[command(about = "WebSocket front end and worker supervisor for a document-editing service")]
#[command(version)]
pub struct Options {
    /// Port for client connections
    #[arg(long, default_value_t = DEFAULT_CLIENT_PORT)]
    pub port: u16,

    /// Cache directory; must be readable and writable
    #[arg(long, default_value = DEFAULT_CACHE_DIR)]
    pub cache: PathBuf,

    /// Template tree the broker copies into each jail
    #[arg(long)]
    pub systemplate: PathBuf,

    /// Installation of the document engine
    #[arg(long)]
    pub lotemplate: PathBuf,

    /// Directory under which worker jails are created
    #[arg(long)]
    pub childroot: PathBuf,

    /// Path of the engine installation relative to each jail
    #[arg(long, default_value = "lo")]
    pub losubpath: String,

    /// Workers the broker keeps ready
    #[arg(long, default_value_t = 10)]
    pub numprespawns: usize,

    /// Interactive test mode: stdin lines are sent over a client session
    #[arg(long)]
    pub test: bool,

    /// Broker executable (default: docmux-broker next to this binary)
    #[arg(long)]
    pub broker: Option<PathBuf>,

    /// Largest payload accepted through `nextmessage:`
    #[arg(long, default_value_t = DEFAULT_MAX_LARGE_MESSAGE)]
    pub max_message_size: usize,

    /// Uid the broker should switch to
    #[cfg(debug_assertions)]
    #[arg(long)]
    pub uid: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--port must differ from the worker port {WORKER_PORT}")]
    PortConflict,
    #[error("--numprespawns must be at least 1")]
    NoPrespawns,
    #[error("--max-message-size must be positive")]
    NoMessageSize,
    #[error("cannot locate the broker executable: {0}")]
    BrokerPath(std::io::Error),
}

/// Everything the master needs, validated.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub connection: ConnectionSettings,
    pub cache_dir: PathBuf,
    pub child_root: PathBuf,
    pub test_mode: bool,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    pub fifo: PathBuf,
}

impl Options {
    pub fn into_config(self) -> Result<MasterConfig, ConfigError> {
        if self.port == WORKER_PORT {
            return Err(ConfigError::PortConflict);
        }
        if self.numprespawns == 0 {
            return Err(ConfigError::NoPrespawns);
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::NoMessageSize);
        }

        let num_prespawns = if self.test { 1 } else { self.numprespawns };
        let child_root = with_trailing_slash(self.childroot);
        let broker = match self.broker {
            Some(path) => path,
            None => std::env::current_exe()
                .map_err(ConfigError::BrokerPath)?
                .with_file_name(BROKER_BINARY),
        };

        #[cfg(debug_assertions)]
        let uid = self.uid;
        #[cfg(not(debug_assertions))]
        let uid = None;

        Ok(MasterConfig {
            server: ServerConfig {
                client_port: self.port,
                pool_capacity: (num_prespawns * HANDLERS_PER_PRESPAWN).max(MIN_POOL_CAPACITY),
                ..ServerConfig::default()
            },
            supervisor: SupervisorConfig {
                broker,
                lo_subpath: self.losubpath,
                sys_template: self.systemplate,
                lo_template: self.lotemplate,
                child_root: child_root.clone(),
                num_prespawns,
                client_port: self.port,
                uid,
                poll_batch: DEFAULT_POLL_BATCH,
                maintenance_sleep: DEFAULT_MAINTENANCE_SLEEP,
            },
            connection: ConnectionSettings {
                max_large_message: self.max_message_size,
                ..ConnectionSettings::default()
            },
            cache_dir: self.cache,
            child_root,
            test_mode: self.test,
            pid_file: PathBuf::from(PID_FILE),
            lock_file: PathBuf::from(LOCK_FILE),
            fifo: PathBuf::from(BROKER_FIFO),
        })
    }
}

fn with_trailing_slash(path: PathBuf) -> PathBuf {
    let mut raw = path.into_os_string();
    if !raw.to_string_lossy().ends_with('/') {
        raw.push("/");
    }
    PathBuf::from(raw)
}
