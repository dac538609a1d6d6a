//! Transport layer for docmux.
//!
//! Both listeners speak HTTP and upgrade to WebSocket via axum.

pub mod http;

pub use http::{ListenerPair, ServerConfig};
