//! Frame reader: one WebSocket frame at a time, classified as control or data.
//!
//! The reader enforces two size limits. Ordinary frames must fit the primary
//! receive buffer. A frame announced through `nextmessage: size=<N>` may be up
//! to `N` bytes, but `N` itself is capped by a configured ceiling so a peer
//! cannot make us reserve arbitrary amounts of memory.

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Stream, StreamExt};

/// Size of the primary receive buffer.
pub const RECEIVE_BUFFER_LEN: usize = 200_000;

/// Default ceiling for sizes declared through the nextmessage extension.
pub const DEFAULT_MAX_LARGE_MESSAGE: usize = 64 * 1024 * 1024;

/// Close code sent when a frame or a declared size is too large.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// A classified WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text or binary payload.
    Data(Bytes),
    Ping,
    /// Keep-alive answer. Never reaches a session.
    Pong,
    /// Close with the peer's status code, if any.
    Close(Option<u16>),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    Oversized { len: usize, limit: usize },
    #[error("declared message size {declared} exceeds the {ceiling} byte ceiling")]
    DeclaredSizeTooLarge { declared: usize, ceiling: usize },
    #[error("websocket read failed: {0}")]
    Transport(String),
}

impl FrameError {
    /// Close status to send to the peer before dropping the connection.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Oversized { .. } | Self::DeclaredSizeTooLarge { .. } => {
                Some(CLOSE_MESSAGE_TOO_BIG)
            }
            Self::Transport(_) => None,
        }
    }
}

/// Reads frames from any stream of WebSocket messages.
pub struct FrameReader<S> {
    stream: S,
    buffer_len: usize,
    max_large_message: usize,
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer_len: RECEIVE_BUFFER_LEN,
            max_large_message: DEFAULT_MAX_LARGE_MESSAGE,
        }
    }

    pub fn with_buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = len;
        self
    }

    pub fn with_max_large_message(mut self, ceiling: usize) -> Self {
        self.max_large_message = ceiling;
        self
    }

    /// Read the next frame. `Ok(None)` means the peer went away.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        self.read_limited(self.buffer_len).await
    }

    /// Read the payload announced by a `nextmessage:` line.
    ///
    /// Control frames arriving in between are skipped. `Ok(None)` means the
    /// connection closed before the payload arrived.
    pub async fn read_sized(&mut self, declared: usize) -> Result<Option<Bytes>, FrameError> {
        if declared > self.max_large_message {
            return Err(FrameError::DeclaredSizeTooLarge {
                declared,
                ceiling: self.max_large_message,
            });
        }

        loop {
            match self.read_limited(declared).await? {
                Some(Frame::Data(bytes)) => return Ok(Some(bytes)),
                Some(Frame::Ping | Frame::Pong) => continue,
                Some(Frame::Close(_)) | None => return Ok(None),
            }
        }
    }

    async fn read_limited(&mut self, limit: usize) -> Result<Option<Frame>, FrameError> {
        let message = match self.stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(FrameError::Transport(e.to_string())),
            None => return Ok(None),
        };

        let frame = match message {
            Message::Text(text) => Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Binary(bytes) => Frame::Data(bytes),
            Message::Ping(_) => Frame::Ping,
            Message::Pong(_) => Frame::Pong,
            Message::Close(frame) => Frame::Close(frame.map(|f| f.code)),
        };

        if let Frame::Data(ref bytes) = frame
            && bytes.len() > limit
        {
            return Err(FrameError::Oversized {
                len: bytes.len(),
                limit,
            });
        }

        Ok(Some(frame))
    }
}
