//! docmux: WebSocket front end and process supervisor for a document-editing service.

pub mod config;
pub mod connection;
pub mod fatal;
pub mod frame;
pub mod interactive;
pub mod jail;
pub mod master;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod startup;
pub mod supervisor;
pub mod transport;

pub use config::{MasterConfig, Options};
pub use connection::{ConnectionContext, ConnectionSettings, handle_websocket};
pub use fatal::{ConsumerFault, FatalReporter};
pub use frame::{Frame, FrameError, FrameReader};
pub use jail::Jail;
pub use master::{ExitStatus, serve};
pub use queue::MessageQueue;
pub use session::{ClientSession, PrisonerSession, Session, SessionBroker};
pub use supervisor::{BrokerCommand, BrokerSpawner, ProcessSupervisor, SupervisorConfig};
pub use transport::{ListenerPair, ServerConfig};
