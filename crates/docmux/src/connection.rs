//! Lifetime of one upgraded WebSocket connection.
//!
//! The handler owns the session, drives the read loop, and applies the two
//! delivery policies. A ToClient session's single-line commands go through its
//! [`MessageQueue`] and are consumed by a dedicated task. Everything else
//! (worker traffic, frames with a payload, nextmessage payloads) is handed to
//! the session inline on the reading task.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::fatal::{ConsumerFault, FatalReporter};
use crate::frame::{
    DEFAULT_MAX_LARGE_MESSAGE, Frame, FrameError, FrameReader, RECEIVE_BUFFER_LEN,
};
use crate::protocol::{
    EOF_MESSAGE, abbreviate, first_line, is_single_line, next_message_size, tokenize,
};
use crate::queue::MessageQueue;
use crate::session::{
    ClientSession, Kind, Outbound, PrisonerSession, Session, SessionBroker, SessionId,
};

/// Bounded wait of one read before the termination flag is checked again.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long queued outbound messages may take to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub poll_interval: Duration,
    pub receive_buffer_len: usize,
    pub max_large_message: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            receive_buffer_len: RECEIVE_BUFFER_LEN,
            max_large_message: DEFAULT_MAX_LARGE_MESSAGE,
        }
    }
}

/// Everything a connection handler needs from the rest of the process.
#[derive(Clone)]
pub struct ConnectionContext {
    pub broker: Arc<SessionBroker>,
    pub fatal: FatalReporter,
    pub termination: CancellationToken,
    pub settings: ConnectionSettings,
}

/// Run an upgraded connection until it closes or termination is requested.
pub async fn handle_websocket(socket: WebSocket, kind: Kind, ctx: ConnectionContext) {
    let (sink, stream) = socket.split();
    let (outbound, outbound_rx) = Outbound::channel();
    let writer_done = CancellationToken::new();
    let mut writer = tokio::spawn(write_outbound(sink, outbound_rx, writer_done.clone()));

    // Cancelled on termination, or when the queue consumer asks to stop.
    let ended = ctx.termination.child_token();

    let session: Arc<dyn Session> = match kind {
        Kind::ToClient => Arc::new(ClientSession::new(
            Arc::clone(&ctx.broker),
            outbound.clone(),
        )),
        Kind::ToPrisoner => Arc::new(PrisonerSession::new(
            Arc::clone(&ctx.broker),
            outbound.clone(),
        )),
    };

    let span = tracing::info_span!(
        "session",
        kind = %kind,
        session_id = %session.id().map(|id| id.to_string()).unwrap_or_default(),
    );

    // Only client sessions carry an identity, and only they get a queue.
    let consumer = session.id().map(|session_id| {
        let queue = Arc::new(MessageQueue::new());
        let handle = tokio::spawn(
            run_consumer(
                Arc::clone(&queue),
                Arc::clone(&session),
                session_id,
                ended.clone(),
            )
            .instrument(span.clone()),
        );
        (queue, handle, session_id)
    });

    async {
        tracing::info!("Session started");

        let mut reader = FrameReader::new(stream)
            .with_buffer_len(ctx.settings.receive_buffer_len)
            .with_max_large_message(ctx.settings.max_large_message);
        let outcome = read_loop(
            &mut reader,
            session.as_ref(),
            consumer.as_ref().map(|(queue, _, _)| queue.as_ref()),
            ctx.settings.poll_interval,
            &ended,
        )
        .await;

        if let Some((queue, handle, session_id)) = consumer {
            queue.shutdown();
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(fault)) => ctx.fatal.report(fault),
                Err(e) => ctx.fatal.report(ConsumerFault {
                    session_id,
                    reason: e.to_string(),
                }),
            }
        }

        session.close().await;

        if let Err(e) = &outcome {
            tracing::warn!(error = %e, "Connection failed");
            if let Some(code) = e.close_code() {
                let _ = outbound.close(code, "message too big").await;
            }
        }

        tracing::info!("Session ended");
    }
    .instrument(span)
    .await;

    drop(session);
    drop(outbound);
    tokio::select! {
        _ = &mut writer => {}
        _ = tokio::time::sleep(WRITER_DRAIN_TIMEOUT) => {
            writer_done.cancel();
            let _ = writer.await;
        }
    }
}

/// Drain a session's outbound channel into the socket.
async fn write_outbound<S>(mut sink: S, mut rx: mpsc::Receiver<Message>, done: CancellationToken)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            _ = done.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "Socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Read frames and deliver them to `session` until the connection ends.
///
/// `queue` is present for ToClient sessions only; their single-line commands
/// are queued, as raw bytes, instead of being handled inline.
///
/// A `nextmessage:` announcement is recognised before the queue decision, for
/// both session kinds, so a ToClient marker is never queued and its payload is
/// always dispatched inline. Checking it only on the inline path would leave a
/// queued marker to reach the session as an ordinary command.
pub async fn read_loop<S, E>(
    reader: &mut FrameReader<S>,
    session: &dyn Session,
    queue: Option<&MessageQueue>,
    poll_interval: Duration,
    ended: &CancellationToken,
) -> Result<(), FrameError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let frame = tokio::select! {
            _ = ended.cancelled() => {
                tracing::debug!("Stopping read loop on request");
                return Ok(());
            }
            polled = tokio::time::timeout(poll_interval, reader.read_frame()) => match polled {
                Ok(frame) => frame?,
                Err(_) => continue,
            },
        };

        let data = match frame {
            Some(Frame::Data(data)) => data,
            Some(Frame::Ping | Frame::Pong) => continue,
            Some(Frame::Close(code)) => {
                tracing::debug!(?code, "Peer closed the connection");
                return Ok(());
            }
            None => return Ok(()),
        };

        // Zero-length read.
        if data.is_empty() {
            return Ok(());
        }

        let line = first_line(&data);
        if line == EOF_MESSAGE {
            tracing::debug!("Received eof");
            return Ok(());
        }
        tracing::trace!(message = %abbreviate(&data), "Received");

        if let Some(size) = next_message_size(&tokenize(&line)) {
            tracing::debug!(size, "Reading large message");
            let payload = tokio::select! {
                _ = ended.cancelled() => return Ok(()),
                payload = reader.read_sized(size) => payload?,
            };
            match payload {
                Some(payload) => {
                    if !dispatch(session, &payload).await {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
            continue;
        }

        match queue {
            Some(queue) if is_single_line(&data) => queue.put(data.clone()),
            _ => {
                if !dispatch(session, &data).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Hand one message to the session inline. `false` ends the read loop.
async fn dispatch(session: &dyn Session, data: &[u8]) -> bool {
    match session.handle_input(data).await {
        Ok(more) => more,
        Err(e) => {
            tracing::warn!(error = %e, "Session failed to handle input");
            false
        }
    }
}

/// Feed queued commands to the session until the `eof` sentinel.
///
/// A session that asks to stop cancels `ended` and the consumer then waits for
/// the sentinel without handling anything else. An error escaping the session
/// is a fault.
pub async fn run_consumer(
    queue: Arc<MessageQueue>,
    session: Arc<dyn Session>,
    session_id: SessionId,
    ended: CancellationToken,
) -> Result<(), ConsumerFault> {
    loop {
        let item = queue.get().await;
        if item == EOF_MESSAGE {
            return Ok(());
        }

        match session.handle_input(&item).await {
            Ok(true) => {}
            Ok(false) => {
                ended.cancel();
                while queue.get().await != EOF_MESSAGE {}
                return Ok(());
            }
            Err(e) => {
                return Err(ConsumerFault {
                    session_id,
                    reason: e.to_string(),
                });
            }
        }
    }
}
