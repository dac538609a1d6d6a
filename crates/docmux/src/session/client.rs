use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::broker::{SessionBroker, WorkerLink};
use super::{Kind, Outbound, Session, SessionError, SessionId};
use crate::protocol::{first_line, tokenize, token_value};

const LOAD_COMMAND: &str = "load";
const DISCONNECT_COMMAND: &str = "disconnect";
const FILE_URL_PREFIX: &str = "file://";

/// Session facing an end user.
///
/// Unpaired until the first `load`, which claims a worker. Every later
/// command is forwarded to that worker unchanged.
pub struct ClientSession {
    id: SessionId,
    outbound: Outbound,
    broker: Arc<SessionBroker>,
    worker: Mutex<Option<Arc<WorkerLink>>>,
}

impl ClientSession {
    pub fn new(broker: Arc<SessionBroker>, outbound: Outbound) -> Self {
        Self {
            id: broker.next_session_id(),
            outbound,
            broker,
            worker: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.id
    }

    /// Identifier of the paired worker, once a document is loaded.
    pub async fn worker_id(&self) -> Option<String> {
        self.worker
            .lock()
            .await
            .as_ref()
            .map(|w| w.worker_id().to_string())
    }

    /// Answer the client with an error line. `Ok(false)` once the client is gone.
    async fn reply_error(&self, cmd: &str, kind: &str) -> Result<bool, SessionError> {
        tracing::debug!(session_id = %self.id, cmd, kind, "Replying with error");
        match self
            .outbound
            .send_text(format!("error: cmd={cmd} kind={kind}"))
            .await
        {
            Ok(()) => Ok(true),
            Err(SessionError::ChannelClosed) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn load(&self, data: &[u8]) -> Result<bool, SessionError> {
        let mut worker = self.worker.lock().await;
        let link = match worker.as_ref() {
            Some(link) => Arc::clone(link),
            None => {
                match self
                    .broker
                    .claim_worker(self.id, self.outbound.clone())
                    .await
                {
                    Some(link) => {
                        *worker = Some(Arc::clone(&link));
                        link
                    }
                    None => {
                        drop(worker);
                        return self.reply_error(LOAD_COMMAND, "noworker").await;
                    }
                }
            }
        };
        drop(worker);

        let message = self.localize_load(link.worker_id(), data);
        self.forward(&link, LOAD_COMMAND, &message).await
    }

    /// Rewrite a `url=file://` pointing at a host file into the worker's jail.
    fn localize_load(&self, worker_id: &str, data: &[u8]) -> Vec<u8> {
        let line = first_line(data);
        let tokens = tokenize(&line);
        let Some(url) = tokens.iter().find_map(|t| token_value(t, "url")) else {
            return data.to_vec();
        };
        let Some(encoded) = url.strip_prefix(FILE_URL_PREFIX) else {
            return data.to_vec();
        };
        let host_path = match urlencoding::decode(encoded) {
            Ok(path) => path.into_owned(),
            Err(_) => return data.to_vec(),
        };
        if !Path::new(&host_path).is_file() {
            return data.to_vec();
        }

        let jailed = match self.broker.jail().localize(worker_id, Path::new(&host_path)) {
            Ok(jailed) => jailed,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.id,
                    worker_id,
                    path = %host_path,
                    error = %e,
                    "Failed to link document into jail"
                );
                return data.to_vec();
            }
        };

        let rewritten: Vec<String> = tokens
            .iter()
            .map(|t| {
                if token_value(t, "url").is_some() {
                    format!("url={jailed}")
                } else {
                    (*t).to_string()
                }
            })
            .collect();
        let payload = data
            .iter()
            .position(|&b| b == b'\n')
            .map_or(&[][..], |newline| &data[newline..]);
        let mut message = rewritten.join(" ").into_bytes();
        message.extend_from_slice(payload);
        message
    }

    async fn forward(
        &self,
        link: &WorkerLink,
        cmd: &str,
        data: &[u8],
    ) -> Result<bool, SessionError> {
        match link.send(data).await {
            Ok(()) => Ok(true),
            Err(_) => {
                tracing::warn!(
                    session_id = %self.id,
                    worker_id = %link.worker_id(),
                    cmd,
                    "Worker connection is gone"
                );
                self.reply_error(cmd, "workerdied").await?;
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Session for ClientSession {
    fn kind(&self) -> Kind {
        Kind::ToClient
    }

    fn id(&self) -> Option<SessionId> {
        Some(self.id)
    }

    async fn handle_input(&self, data: &[u8]) -> Result<bool, SessionError> {
        let line = first_line(data);
        let Some(cmd) = tokenize(&line).first().map(|c| c.to_string()) else {
            return Ok(true);
        };

        if cmd == LOAD_COMMAND {
            return self.load(data).await;
        }

        let link = self.worker.lock().await.clone();
        match link {
            Some(link) => self.forward(&link, &cmd, data).await,
            None => self.reply_error(&cmd, "nodocloaded").await,
        }
    }

    async fn close(&self) {
        let Some(link) = self.worker.lock().await.take() else {
            return;
        };
        link.unpair();
        tracing::info!(
            session_id = %self.id,
            worker_id = %link.worker_id(),
            "Session ended, disconnecting worker"
        );
        if let Err(e) = link.send_text(DISCONNECT_COMMAND).await {
            tracing::debug!(worker_id = %link.worker_id(), error = %e, "Worker already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jail::Jail;
    use crate::session::BrokerSettings;
    use crate::supervisor::TrackedSet;
    use axum::extract::ws::Message;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn text(message: Option<Message>) -> String {
        match message {
            Some(Message::Text(t)) => t.to_string(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    struct Fixture {
        broker: Arc<SessionBroker>,
        _tracked: TrackedSet,
        root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let tracked = TrackedSet::new();
        tracked.track(std::process::id() as i32, "test");
        let mut settings = BrokerSettings::new(Jail::new(root.path()));
        settings.claim_timeout = Duration::from_millis(50);
        let broker = Arc::new(SessionBroker::new(settings, tracked.view()));
        Fixture {
            broker,
            _tracked: tracked,
            root,
        }
    }

    fn add_worker(broker: &SessionBroker, id: &str) -> (Arc<WorkerLink>, Receiver<Message>) {
        let (out, rx) = Outbound::channel();
        let link = Arc::new(WorkerLink::new(id, std::process::id() as i32, out));
        broker.register_worker(Arc::clone(&link)).unwrap();
        (link, rx)
    }

    #[tokio::test]
    async fn commands_before_load_are_refused() {
        let f = fixture();
        let (out, mut rx) = Outbound::channel();
        let session = ClientSession::new(Arc::clone(&f.broker), out);

        assert!(session.handle_input(b"status").await.unwrap());
        assert_eq!(text(rx.recv().await), "error: cmd=status kind=nodocloaded");
    }

    #[tokio::test]
    async fn load_without_workers_reports_noworker() {
        let f = fixture();
        let (out, mut rx) = Outbound::channel();
        let session = ClientSession::new(Arc::clone(&f.broker), out);

        assert!(session.handle_input(b"load url=file:///x.odt").await.unwrap());
        assert_eq!(text(rx.recv().await), "error: cmd=load kind=noworker");
        assert_eq!(session.worker_id().await, None);
    }

    #[tokio::test]
    async fn load_links_host_document_into_jail() {
        let f = fixture();
        let (_link, mut worker_rx) = add_worker(&f.broker, "w7");
        let host = tempfile::tempdir().unwrap();
        let doc = host.path().join("doc.odt");
        std::fs::write(&doc, b"content").unwrap();

        let (out, _rx) = Outbound::channel();
        let session = ClientSession::new(Arc::clone(&f.broker), out);
        let command = format!("load url=file://{} part=0", doc.display());
        assert!(session.handle_input(command.as_bytes()).await.unwrap());

        assert_eq!(
            text(worker_rx.recv().await),
            "load url=file:///user/docs/doc.odt part=0"
        );
        assert!(f.root.path().join("w7/user/docs/doc.odt").exists());
        assert_eq!(session.worker_id().await.as_deref(), Some("w7"));

        assert!(session.handle_input(b"status").await.unwrap());
        assert_eq!(text(worker_rx.recv().await), "status");
    }

    #[tokio::test]
    async fn forward_to_dead_worker_ends_session() {
        let f = fixture();
        let (_link, worker_rx) = add_worker(&f.broker, "w1");
        let (out, mut rx) = Outbound::channel();
        let session = ClientSession::new(Arc::clone(&f.broker), out);

        assert!(session.handle_input(b"load url=http://remote/doc").await.unwrap());
        drop(worker_rx);

        assert!(!session.handle_input(b"status").await.unwrap());
        assert_eq!(text(rx.recv().await), "error: cmd=status kind=workerdied");
    }

    #[tokio::test]
    async fn close_disconnects_the_worker() {
        let f = fixture();
        let (link, mut worker_rx) = add_worker(&f.broker, "w1");
        let (out, _rx) = Outbound::channel();
        let session = ClientSession::new(Arc::clone(&f.broker), out);

        session.handle_input(b"load url=http://remote/doc").await.unwrap();
        let _load = worker_rx.recv().await;
        session.close().await;

        assert_eq!(text(worker_rx.recv().await), "disconnect");
        assert!(!link.is_paired());
    }
}
