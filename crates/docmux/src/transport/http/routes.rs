//! Request classification and the plain HTTP endpoints.
//!
//! Every request lands in one fallback handler: WebSocket upgrades become
//! sessions, anything else is dispatched by path to convert-to, insertfile,
//! or download.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Query, Request,
        State, WebSocketUpgrade, ws::Message,
    },
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::connection::{ConnectionContext, handle_websocket};
use crate::jail::{JAIL_DOCUMENT_DIR, JailError, safe_component};
use crate::protocol::{find_token, first_line, tokenize};
use crate::session::{ClientSession, Kind, Outbound, Session, SessionError};

use super::pool::{Admission, ConnectionPool};

/// Path workers open on the loopback listener.
pub const WORKER_PATH: &str = "/docmux/child/";

/// How long a conversion may take once the worker has the document.
const CONVERT_TIMEOUT: Duration = Duration::from_secs(60);

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Client,
    Worker,
}

impl ListenerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Worker => "worker",
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub listener: ListenerKind,
    pub pool: Arc<ConnectionPool>,
    pub ctx: ConnectionContext,
}

/// Errors on the plain HTTP paths. Always answered with an empty body.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("bad request")]
    BadRequest,
    #[error("not found")]
    NotFound,
    #[error("no worker available")]
    Unavailable,
    #[error("timed out waiting for the worker")]
    Timeout,
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(ref reason) => {
                tracing::error!(reason = %reason, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        status.into_response()
    }
}

impl From<std::io::Error> for HttpError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<JailError> for HttpError {
    fn from(e: JailError) -> Self {
        match e {
            JailError::InvalidComponent(_) | JailError::NotLocal(_) => Self::BadRequest,
            JailError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<SessionError> for HttpError {
    fn from(e: SessionError) -> Self {
        Self::Internal(e.to_string())
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Worker sessions only exist on the loopback listener at the reserved path.
pub fn classify(listener: ListenerKind, path: &str) -> Kind {
    if listener == ListenerKind::Worker && path == WORKER_PATH {
        Kind::ToPrisoner
    } else {
        Kind::ToClient
    }
}

async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    tracing::info!(
        listener = state.listener.as_str(),
        method = %request.method(),
        uri = %request.uri(),
        ?peer,
        headers = ?request.headers(),
        "Request"
    );

    let Some(admission) = state.pool.admit() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    if is_upgrade_request(request.headers()) {
        return upgrade(state, admission, request).await;
    }

    let response = serve_plain(&state, request)
        .await
        .unwrap_or_else(IntoResponse::into_response);
    drop(admission);
    response
}

async fn upgrade(state: AppState, admission: Admission, request: Request) -> Response {
    let kind = classify(state.listener, request.uri().path());
    let version_ok = request
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13");

    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "WebSocket handshake failed");
            return handshake_failed(version_ok);
        }
    };

    let settings = &state.ctx.settings;
    let limit = settings.max_large_message.max(settings.receive_buffer_len);
    let ctx = state.ctx.clone();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let _admission = admission;
            handle_websocket(socket, kind, ctx).await;
        })
}

fn handshake_failed(version_ok: bool) -> Response {
    if version_ok {
        StatusCode::BAD_REQUEST.into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            [(header::SEC_WEBSOCKET_VERSION, "13")],
        )
            .into_response()
    }
}

async fn serve_plain(state: &AppState, request: Request) -> Result<Response, HttpError> {
    let method = request.method().clone();
    let segments: Vec<String> = request
        .uri()
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    match (method, segments.first().map(String::as_str)) {
        (Method::POST, Some("convert-to")) => convert_to(state, request).await,
        (Method::POST, Some("insertfile")) => insert_file(state, request).await,
        (Method::GET, _) if segments.len() >= 3 => {
            download(state, &segments, request.uri().clone()).await
        }
        _ => Err(HttpError::BadRequest),
    }
}

/// A multipart request: plain fields plus at most one staged file.
#[derive(Debug, Default)]
struct Upload {
    fields: HashMap<String, String>,
    file: Option<StagedFile>,
}

#[derive(Debug)]
struct StagedFile {
    name: String,
    path: PathBuf,
}

impl Upload {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

async fn read_upload(
    state: &AppState,
    request: Request,
    staging: &Path,
) -> Result<Upload, HttpError> {
    let mut multipart = Multipart::from_request(request, state).await.map_err(|e| {
        tracing::warn!(error = %e, "Not a multipart request");
        HttpError::BadRequest
    })?;

    let mut upload = Upload::default();
    loop {
        let field = multipart.next_field().await.map_err(|e| {
            tracing::warn!(error = %e, "Malformed multipart body");
            HttpError::BadRequest
        })?;
        let Some(mut field) = field else {
            break;
        };

        let name = field.name().unwrap_or_default().to_string();
        let Some(file_name) = field.file_name().map(str::to_string) else {
            let value = field.text().await.map_err(|_| HttpError::BadRequest)?;
            upload.fields.insert(name, value);
            continue;
        };

        let file_name = Path::new(&file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(HttpError::BadRequest)?
            .to_string();
        let path = staging.join(&file_name);
        let mut out = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = field.chunk().await.map_err(|_| HttpError::BadRequest)? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        tracing::debug!(field = %name, file = %file_name, "Staged upload");
        upload.file = Some(StagedFile {
            name: file_name,
            path,
        });
    }
    Ok(upload)
}

fn file_url(path: &Path) -> String {
    let encoded = urlencoding::encode(&path.to_string_lossy()).replace("%2F", "/");
    format!("file://{encoded}")
}

/// `POST /convert-to`: load the upload in a worker, save it in `format`, and
/// return the result.
async fn convert_to(state: &AppState, request: Request) -> Result<Response, HttpError> {
    let staging = tempfile::tempdir()?;
    let upload = read_upload(state, request, staging.path()).await?;

    let format = upload.field("format").ok_or(HttpError::BadRequest)?;
    if safe_component(format).is_err() || format.contains(char::is_whitespace) {
        return Err(HttpError::BadRequest);
    }
    let file = upload.file.as_ref().ok_or(HttpError::BadRequest)?;

    let stem = Path::new(&file.name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let output_name = format!("{stem}.{format}");

    let (outbound, mut replies) = Outbound::channel();
    let session = ClientSession::new(Arc::clone(&state.ctx.broker), outbound);
    tracing::info!(
        session_id = %session.session_id(),
        file = %file.name,
        format,
        "Converting document"
    );

    let converted = run_conversion(
        state,
        &session,
        &mut replies,
        &file.path,
        &output_name,
        format,
    )
    .await;
    session.close().await;
    let bytes = converted?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, OCTET_STREAM.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{output_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn run_conversion(
    state: &AppState,
    session: &ClientSession,
    replies: &mut mpsc::Receiver<Message>,
    staged: &Path,
    output_name: &str,
    format: &str,
) -> Result<Vec<u8>, HttpError> {
    let load = format!("load url={}", file_url(staged));
    session.handle_input(load.as_bytes()).await?;
    let Some(worker_id) = session.worker_id().await else {
        return Err(HttpError::Unavailable);
    };

    let target = format!(
        "file://{JAIL_DOCUMENT_DIR}/{}",
        urlencoding::encode(output_name)
    );
    let saveas = format!("saveas url={target} format={format} options=");
    if !session.handle_input(saveas.as_bytes()).await? {
        return Err(HttpError::Internal("worker died during conversion".into()));
    }

    let url = tokio::select! {
        _ = state.ctx.termination.cancelled() => {
            tracing::info!(worker_id = %worker_id, "Conversion abandoned on shutdown");
            return Err(HttpError::Unavailable);
        }
        waited = tokio::time::timeout(CONVERT_TIMEOUT, wait_for_saveas(replies)) => {
            waited.map_err(|_| HttpError::Timeout)??
        }
    };
    let path = state.ctx.broker.jail().resolve_url(&worker_id, &url)?;
    tracing::debug!(path = %path.display(), "Conversion finished");
    Ok(tokio::fs::read(&path).await?)
}

/// Wait for the worker's `saveas: url=<url>` answer.
async fn wait_for_saveas(replies: &mut mpsc::Receiver<Message>) -> Result<String, HttpError> {
    while let Some(message) = replies.recv().await {
        let data = match &message {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(bytes) => bytes.as_ref(),
            _ => continue,
        };
        let line = first_line(data);
        let tokens = tokenize(&line);
        match tokens.first().copied() {
            Some("saveas:") => {
                return find_token(&tokens, "url")
                    .map(str::to_string)
                    .ok_or_else(|| HttpError::Internal(format!("malformed reply: {line}")));
            }
            Some("error:") => return Err(HttpError::Internal(line.to_string())),
            _ => {}
        }
    }
    Err(HttpError::Internal("session closed before the document was saved".into()))
}

fn cors_headers() -> [(header::HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
        (
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Origin, X-Requested-With, Content-Type, Accept",
        ),
    ]
}

/// `POST /insertfile`: move an upload into a worker's jail.
async fn insert_file(state: &AppState, request: Request) -> Result<Response, HttpError> {
    let staging = tempfile::tempdir()?;
    let upload = read_upload(state, request, staging.path()).await?;

    let child_id = upload.field("childid").ok_or(HttpError::BadRequest)?;
    let name = upload.field("name").ok_or(HttpError::BadRequest)?;
    let file = upload.file.as_ref().ok_or(HttpError::BadRequest)?;

    let target = state.ctx.broker.jail().insert_file(child_id, name, &file.path)?;
    tracing::info!(child_id, target = %target.display(), "Inserted file");
    Ok((StatusCode::OK, cors_headers()).into_response())
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    mime_type: Option<String>,
}

/// `GET /<worker-id>/<dir>/<urlencoded-file>`: serve a file the worker
/// prepared, then remove its directory.
async fn download(
    state: &AppState,
    segments: &[String],
    uri: Uri,
) -> Result<Response, HttpError> {
    let file_name = urlencoding::decode(&segments[2]).map_err(|_| HttpError::BadRequest)?;
    let (dir, path) = state
        .ctx
        .broker
        .jail()
        .download_paths(&segments[0], &segments[1], &file_name)?;
    if !path.is_file() {
        tracing::info!(path = %path.display(), "Download not found");
        return Err(HttpError::NotFound);
    }

    let mime_type = Query::<DownloadQuery>::try_from_uri(&uri)
        .ok()
        .and_then(|q| q.0.mime_type)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| OCTET_STREAM.to_string());

    let bytes = tokio::fs::read(&path).await?;
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove download directory");
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

pub fn routes(state: AppState) -> Router {
    let body_limit = state.ctx.settings.max_large_message;
    Router::new()
        .fallback(handle_request)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
