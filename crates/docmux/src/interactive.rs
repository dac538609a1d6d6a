//! Interactive test mode: a client session driven from stdin.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::protocol::abbreviate;

#[derive(Debug, thiserror::Error)]
pub enum InteractiveError {
    #[error("cannot connect to {url}: {source}")]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("reading input failed: {0}")]
    Input(#[from] std::io::Error),
}

/// Open a client session on our own port and send every input line as a
/// frame. Returns at end of input, when the server closes, or on termination.
pub async fn run_client<R>(
    client_addr: SocketAddr,
    input: R,
    termination: &CancellationToken,
) -> Result<(), InteractiveError>
where
    R: AsyncBufRead + Unpin,
{
    let url = format!("ws://127.0.0.1:{}/ws", client_addr.port());
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|source| InteractiveError::Connect {
            url: url.clone(),
            source,
        })?;
    tracing::info!(%url, "Interactive session connected");

    let (mut sink, mut stream) = socket.split();
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    tracing::trace!(message = %abbreviate(text.as_str().as_bytes()), "Client got")
                }
                Ok(Message::Binary(data)) => {
                    tracing::trace!(message = %abbreviate(&data), "Client got")
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            _ = termination.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("End of input");
            break;
        };
        if line.is_empty() {
            continue;
        }
        sink.send(Message::Text(line.into())).await?;
    }

    let _ = sink.send(Message::Close(None)).await;
    reader.abort();
    Ok(())
}
