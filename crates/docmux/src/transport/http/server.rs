//! Client and worker listeners.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connection::ConnectionContext;

use super::pool::ConnectionPool;
use super::routes::{AppState, ListenerKind, routes};

/// Fixed loopback port workers connect back to.
pub const WORKER_PORT: u16 = 9981;

pub const DEFAULT_CLIENT_PORT: u16 = 9980;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub client_host: String,
    pub client_port: u16,
    pub worker_host: String,
    pub worker_port: u16,
    /// Concurrent handlers per listener.
    pub pool_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_host: "0.0.0.0".to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            worker_host: "127.0.0.1".to_string(),
            worker_port: WORKER_PORT,
            pool_capacity: 50,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {0}")]
    Address(String),
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

/// One bound socket serving requests until stopped.
pub struct Listener {
    kind: ListenerKind,
    addr: SocketAddr,
    pool: Arc<ConnectionPool>,
    stop: CancellationToken,
    task: JoinHandle<io::Result<()>>,
}

impl Listener {
    pub async fn bind(
        kind: ListenerKind,
        host: &str,
        port: u16,
        pool_capacity: usize,
        ctx: ConnectionContext,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| ServerError::Address(format!("{host}:{port}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let pool = Arc::new(ConnectionPool::new(kind.as_str(), pool_capacity));
        let app = routes(AppState {
            listener: kind,
            pool: Arc::clone(&pool),
            ctx,
        });

        let stop = CancellationToken::new();
        let shutdown = stop.clone();
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        });

        info!(listener = kind.as_str(), %addr, capacity = pool.capacity(), "Listening");
        Ok(Self {
            kind,
            addr,
            pool,
            stop,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and refuse new handlers.
    pub fn stop(&self) {
        self.stop.cancel();
        self.pool.stop();
    }

    /// Wait for the accept loop and every admitted handler to finish.
    pub async fn join(self) {
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(listener = self.kind.as_str(), error = %e, "Listener failed")
            }
            Err(e) => {
                tracing::error!(listener = self.kind.as_str(), error = %e, "Listener task panicked")
            }
        }
        self.pool.join().await;
        info!(listener = self.kind.as_str(), "Listener stopped");
    }
}

/// The public client listener and the loopback worker listener.
pub struct ListenerPair {
    client: Listener,
    worker: Listener,
}

impl ListenerPair {
    pub async fn start(config: &ServerConfig, ctx: ConnectionContext) -> Result<Self, ServerError> {
        let client = Listener::bind(
            ListenerKind::Client,
            &config.client_host,
            config.client_port,
            config.pool_capacity,
            ctx.clone(),
        )
        .await?;
        let worker = match Listener::bind(
            ListenerKind::Worker,
            &config.worker_host,
            config.worker_port,
            config.pool_capacity,
            ctx,
        )
        .await
        {
            Ok(worker) => worker,
            Err(e) => {
                client.stop();
                client.join().await;
                return Err(e);
            }
        };
        Ok(Self { client, worker })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client.local_addr()
    }

    pub fn worker_addr(&self) -> SocketAddr {
        self.worker.local_addr()
    }

    pub fn stop(&self) {
        self.client.stop();
        self.worker.stop();
    }

    pub async fn join(self) {
        self.client.join().await;
        self.worker.join().await;
    }
}

/// Cancel `termination` on SIGTERM, SIGINT, SIGQUIT or SIGHUP.
pub fn install_signal_handlers(termination: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = quit.recv() => "SIGQUIT",
            _ = hup.recv() => "SIGHUP",
            _ = termination.cancelled() => return,
        };
        info!(signal = name, "Received signal, shutting down...");
        termination.cancel();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, Stream, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    use crate::connection::ConnectionSettings;
    use crate::fatal::FatalReporter;
    use crate::jail::Jail;
    use crate::session::{BrokerSettings, SessionBroker};
    use crate::supervisor::TrackedSet;
    use crate::transport::http::WORKER_PATH;

    struct Running {
        pair: ListenerPair,
        termination: CancellationToken,
        root: tempfile::TempDir,
        _tracked: TrackedSet,
    }

    async fn start() -> Running {
        let root = tempfile::tempdir().unwrap();
        let tracked = TrackedSet::new();
        tracked.track(std::process::id() as i32, "test");
        let mut settings = BrokerSettings::new(Jail::new(root.path()));
        settings.claim_timeout = Duration::from_secs(5);
        let (fatal, _) = FatalReporter::channel();
        let termination = CancellationToken::new();
        let ctx = ConnectionContext {
            broker: Arc::new(SessionBroker::new(settings, tracked.view())),
            fatal,
            termination: termination.clone(),
            settings: ConnectionSettings {
                poll_interval: Duration::from_millis(100),
                ..ConnectionSettings::default()
            },
        };
        let config = ServerConfig {
            client_host: "127.0.0.1".to_string(),
            client_port: 0,
            worker_port: 0,
            pool_capacity: 4,
            ..ServerConfig::default()
        };
        let pair = ListenerPair::start(&config, ctx).await.unwrap();
        Running {
            pair,
            termination,
            root,
            _tracked: tracked,
        }
    }

    async fn next_text<S>(socket: &mut S) -> String
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for a message");
            match message {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    async fn shutdown(running: Running) {
        running.termination.cancel();
        running.pair.stop();
        tokio::time::timeout(Duration::from_secs(10), running.pair.join())
            .await
            .expect("listeners did not stop");
    }

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.client_host, "0.0.0.0");
        assert_eq!(config.client_port, 9980);
        assert_eq!(config.worker_host, "127.0.0.1");
        assert_eq!(config.worker_port, WORKER_PORT);
        assert_ne!(config.client_port, config.worker_port);
    }

    #[tokio::test]
    async fn client_traffic_is_relayed_through_a_worker() {
        let running = start().await;

        let worker_url = format!("ws://{}{WORKER_PATH}", running.pair.worker_addr());
        let (mut worker, _) = connect_async(worker_url.as_str()).await.unwrap();
        worker
            .send(Message::Text(
                format!("child w1 {}", std::process::id()).into(),
            ))
            .await
            .unwrap();

        let documents = tempfile::tempdir().unwrap();
        let document = documents.path().join("doc.odt");
        std::fs::write(&document, b"odt").unwrap();

        let client_url = format!("ws://{}/ws", running.pair.client_addr());
        let (mut client, _) = connect_async(client_url.as_str()).await.unwrap();
        client
            .send(Message::Text(
                format!("load url=file://{}", document.display()).into(),
            ))
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut worker).await,
            "load url=file:///user/docs/doc.odt"
        );
        assert!(running.root.path().join("w1/user/docs/doc.odt").is_file());

        worker
            .send(Message::Text("status: type=text parts=1".into()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut client).await, "status: type=text parts=1");

        let payload = "paste mimetype=text/plain\nhello world";
        client
            .send(Message::Text(
                format!("nextmessage: size={}", payload.len()).into(),
            ))
            .await
            .unwrap();
        client.send(Message::Text(payload.into())).await.unwrap();
        assert_eq!(next_text(&mut worker).await, payload);

        client.send(Message::Close(None)).await.unwrap();
        assert_eq!(next_text(&mut worker).await, "disconnect");

        drop(worker);
        shutdown(running).await;
    }

    #[tokio::test]
    async fn commands_before_load_are_refused() {
        let running = start().await;

        let client_url = format!("ws://{}/ws", running.pair.client_addr());
        let (mut client, _) = connect_async(client_url.as_str()).await.unwrap();
        client
            .send(Message::Text("status".into()))
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut client).await,
            "error: cmd=status kind=nodocloaded"
        );

        drop(client);
        shutdown(running).await;
    }

    #[tokio::test]
    async fn oversized_announcement_closes_with_too_big() {
        let running = start().await;

        let client_url = format!("ws://{}/ws", running.pair.client_addr());
        let (mut client, _) = connect_async(client_url.as_str()).await.unwrap();
        client
            .send(Message::Text(
                format!("nextmessage: size={}", usize::MAX / 2).into(),
            ))
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap();
        match message {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1009),
            other => panic!("expected a close frame, got {other:?}"),
        }

        drop(client);
        shutdown(running).await;
    }
}
