//! Session endpoints.
//!
//! A session wraps one connection's outbound side and interprets what the
//! connection receives:
//!
//! - **ToClient** ([`ClientSession`]): an end user. Commands are forwarded to
//!   the worker the session is paired with.
//! - **ToPrisoner** ([`PrisonerSession`]): a worker's control channel back to
//!   the master. Output is forwarded to the paired client.
//!
//! Pairing and the pool of idle workers live in [`SessionBroker`].

mod broker;
mod client;
mod prisoner;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::mpsc;

pub use broker::{BrokerSettings, SessionBroker, WorkerLink};
pub use client::ClientSession;
pub use prisoner::PrisonerSession;

/// Outbound messages buffered per connection before senders wait.
const OUTBOUND_CAPACITY: usize = 1024;

/// Which side of the master a session faces. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    ToClient,
    ToPrisoner,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToClient => "to_client",
            Self::ToPrisoner => "to_prisoner",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a client-facing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Process-wide generator of session identities. Never hands out a value twice.
#[derive(Debug, Default)]
pub struct SessionIds {
    next: AtomicU64,
}

impl SessionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("outbound channel closed")]
    ChannelClosed,
    #[error("unknown worker process {pid}")]
    UnknownWorker { pid: i32 },
    #[error("session has no paired worker")]
    NotPaired,
}

/// Sending half of a connection's outbound message channel.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    /// New outbound channel. The receiver feeds a socket writer, or a caller
    /// that consumes the messages directly.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Message::Text(text.into().into())).await
    }

    /// Send raw message bytes: UTF-8 goes out as text, anything else as binary.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), SessionError> {
        self.send(data_message(data)).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), SessionError> {
        self.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, message: Message) -> Result<(), SessionError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }
}

fn data_message(data: &[u8]) -> Message {
    match std::str::from_utf8(data) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(Bytes::copy_from_slice(data)),
    }
}

/// The contract both session kinds share.
#[async_trait]
pub trait Session: Send + Sync {
    fn kind(&self) -> Kind;

    /// Identity of a client session; `None` for worker-facing sessions.
    fn id(&self) -> Option<SessionId>;

    /// Handle one complete message. `Ok(false)` asks the caller to stop
    /// reading from this session's connection.
    async fn handle_input(&self, data: &[u8]) -> Result<bool, SessionError>;

    /// Release the session's links to other sessions.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_increase() {
        let ids = SessionIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "0001");
    }

    #[test]
    fn session_ids_are_unique_across_threads() {
        let ids = std::sync::Arc::new(SessionIds::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = std::sync::Arc::clone(&ids);
                std::thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<SessionId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }

    #[tokio::test]
    async fn send_data_keeps_text_as_text() {
        let (out, mut rx) = Outbound::channel();
        out.send_data(b"status: ok").await.unwrap();
        out.send_data(&[0xff, 0x00]).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == "status: ok"));
        assert!(matches!(rx.recv().await, Some(Message::Binary(b)) if b.as_ref() == [0xff, 0x00]));
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (out, rx) = Outbound::channel();
        drop(rx);
        assert!(out.is_closed());
        assert!(matches!(
            out.send_text("x").await,
            Err(SessionError::ChannelClosed)
        ));
    }
}
