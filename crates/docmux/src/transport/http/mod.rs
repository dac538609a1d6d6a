//! HTTP and WebSocket transport via axum.

mod pool;
mod routes;
mod server;

pub use pool::{Admission, ConnectionPool, MIN_POOL_CAPACITY};
pub use routes::{AppState, HttpError, ListenerKind, WORKER_PATH, classify, routes};
pub use server::{
    DEFAULT_CLIENT_PORT, Listener, ListenerPair, ServerConfig, ServerError, WORKER_PORT,
    install_signal_handlers,
};
