//! HTTP and websocket front end of the dev server.
//!
//! ```text
//! GET /                 index.html with the HMR client injected, or the
//!                       HMR websocket when the request is an upgrade
//! GET /@hmr/client      client runtime
//! GET /.cache/*         pre-bundled packages, served raw
//! GET /*                ?import stub | transformed module | static file | 404
//! ```

use super::deps::DepCache;
use super::hmr::{HmrBroadcaster, HmrCoordinator, HmrPayload, CLIENT_PATH, CLIENT_RUNTIME, HMR_PROTOCOL};
use super::prebundle::{EsbuildBundler, PackageBundler, PreBundler};
use super::request::{url_path_for, ModuleRequest, RequestError};
use super::transform::{asset_module, js_string, ModuleTransformer, TransformError, JS_CONTENT_TYPE};
use super::watch::{FileChangeKind, FileWatcher, WatchError, WatchedFileEvent, DEFAULT_IGNORED};
use crate::compiler::{CompilerBackend, SwcBackend, TranspileSpec};
use crate::config::DevConfig;
use crate::error::Error;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const CLIENT_TAG: &str = r#"<script type="module" src="/@hmr/client"></script>"#;

/// Shared by every handler.
struct DevState {
    root: PathBuf,
    config: DevConfig,
    cache_prefix: String,
    transformer: Arc<ModuleTransformer>,
    broadcaster: HmrBroadcaster,
    client_runtime: Arc<str>,
}

/// A configured dev server for one root.
#[derive(Clone)]
pub struct DevServer {
    state: Arc<DevState>,
}

impl DevServer {
    /// Server for `root` using SWC and esbuild.
    pub fn new(root: &Path, config: DevConfig) -> Result<Self, Error> {
        let bundler = Arc::new(EsbuildBundler::new(config.bundler.command.clone()));
        Self::with_bundler(root, config, bundler)
    }

    /// Server for `root` with a custom package bundler.
    pub fn with_bundler(
        root: &Path,
        config: DevConfig,
        bundler: Arc<dyn PackageBundler>,
    ) -> Result<Self, Error> {
        let root = dunce::canonicalize(root).map_err(|_| Error::InvalidRoot {
            path: root.to_path_buf(),
        })?;
        if !root.is_dir() {
            return Err(Error::InvalidRoot { path: root });
        }

        let backend: Arc<dyn CompilerBackend> = Arc::new(SwcBackend::new());
        let client_runtime = backend
            .transpile(&TranspileSpec::new("hmr-client.js"), CLIENT_RUNTIME)?
            .code
            .into();

        let deps = Arc::new(DepCache::new());
        let prebundler = Arc::new(PreBundler::new(root.clone(), &config, bundler));
        let transformer = Arc::new(ModuleTransformer::new(
            root.clone(),
            &config,
            backend,
            deps,
            prebundler,
        ));

        Ok(Self {
            state: Arc::new(DevState {
                cache_prefix: config.cache_url_prefix(),
                root,
                config,
                transformer,
                broadcaster: HmrBroadcaster::default(),
                client_runtime,
            }),
        })
    }

    /// The canonical served root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.state.root
    }

    #[must_use]
    pub fn config(&self) -> &DevConfig {
        &self.state.config
    }

    #[must_use]
    pub fn broadcaster(&self) -> &HmrBroadcaster {
        &self.state.broadcaster
    }

    #[must_use]
    pub fn transformer(&self) -> &Arc<ModuleTransformer> {
        &self.state.transformer
    }

    /// The axum router serving this root.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index_or_socket))
            .route(CLIENT_PATH, get(serve_client))
            .fallback(serve_module)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Consume watcher events: invalidate cached modules and broadcast
    /// updates once each path settles. Ends when the channel closes, after
    /// releasing any held updates.
    pub fn spawn_hmr_loop(&self, mut rx: mpsc::UnboundedReceiver<WatchedFileEvent>) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut coordinator = HmrCoordinator::new(state.root.clone(), &state.config.hmr);
            loop {
                let deadline = coordinator.next_deadline();
                let wake = tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else {
                            for payload in coordinator.flush_all() {
                                broadcast_update(&state, &payload);
                            }
                            return;
                        };
                        match event.kind {
                            FileChangeKind::Changed => {
                                if let Some(url) = url_path_for(&state.root, &event.path) {
                                    state.transformer.invalidate(&url);
                                }
                            }
                            FileChangeKind::Created | FileChangeKind::Removed => {
                                state.transformer.invalidate_all();
                            }
                        }
                        if let Some(payload) = coordinator.on_change(&event, Instant::now()) {
                            broadcast_update(&state, &payload);
                        }
                    }
                    () = tokio::time::sleep_until(wake), if deadline.is_some() => {
                        for payload in coordinator.flush_due(Instant::now()) {
                            broadcast_update(&state, &payload);
                        }
                    }
                }
            }
        })
    }

    /// Watch the root and drive the HMR loop until the watcher is dropped.
    pub fn start_watching(&self) -> Result<FileWatcher, WatchError> {
        let mut ignored: Vec<String> = DEFAULT_IGNORED.iter().map(ToString::to_string).collect();
        if let Some(first) = self
            .state
            .config
            .cache_dir
            .trim_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
        {
            ignored.push(first.to_string());
        }

        let (watcher, rx) = FileWatcher::start(&self.state.root, ignored)?;
        self.spawn_hmr_loop(rx);
        Ok(watcher)
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

fn broadcast_update(state: &DevState, payload: &HmrPayload) {
    let clients = state.broadcaster.send(payload);
    if let HmrPayload::Update { updates } = payload {
        for update in updates {
            info!(path = %update.path, clients, "hmr update");
        }
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

type AppState = State<Arc<DevState>>;

async fn index_or_socket(
    State(state): AppState,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => hmr_upgrade(&state, &headers, ws),
        None => serve_index(&state).await,
    }
}

async fn serve_index(state: &DevState) -> Response {
    match tokio::fs::read_to_string(state.root.join("index.html")).await {
        Ok(html) => Html(inject_client(&html)).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "index.html not found").into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to read index.html");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn serve_client(State(state): AppState) -> Response {
    js_response(StatusCode::OK, state.client_runtime.to_string())
}

async fn serve_module(State(state): AppState, uri: Uri) -> Response {
    let request = match ModuleRequest::parse(uri.path(), uri.query()) {
        Ok(request) => request,
        Err(e @ RequestError::EscapesRoot(_)) => {
            warn!(path = uri.path(), "rejected request outside root");
            return (StatusCode::FORBIDDEN, e.to_string()).into_response();
        }
        Err(e @ RequestError::InvalidEncoding(_)) => {
            debug!(path = uri.path(), "rejected undecodable request path");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let url = request.url_path.as_str();
    let ext = request.extension();

    if is_under(url, &state.cache_prefix) {
        let content_type = match ext.as_str() {
            "js" | "mjs" => JS_CONTENT_TYPE,
            other => static_content_type(other).unwrap_or("application/octet-stream"),
        };
        return serve_file(&request.file_path(&state.root), content_type).await;
    }

    if request.import_only {
        return js_response(StatusCode::OK, asset_module(uri.path()));
    }

    if state.transformer.handles_extension(&ext) {
        return match state.transformer.transform(url).await {
            Ok(module) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, module.content_type),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                module.code.clone(),
            )
                .into_response(),
            Err(TransformError::NotFound { .. } | TransformError::Unsupported { .. }) => {
                not_found(url)
            }
            Err(e) => {
                error!(path = url, error = %e, "transform failed");
                let message = format!("[swiftdev] {url}: {e}");
                js_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("console.error({});\n", js_string(&message)),
                )
            }
        };
    }

    match static_content_type(&ext) {
        Some(content_type) => serve_file(&request.file_path(&state.root), content_type).await,
        None => not_found(url),
    }
}

async fn serve_file(path: &Path, content_type: &'static str) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "static file unavailable");
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
    }
}

fn js_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, JS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

fn not_found(url: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("not found: {url}")).into_response()
}

fn is_under(url: &str, prefix: &str) -> bool {
    url.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Content type of files served byte-for-byte.
#[must_use]
pub fn static_content_type(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "html" => "text/html; charset=utf-8",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "map" => "application/json",
        _ => return None,
    })
}

/// Insert the client script right after `<head>`, or prepend it.
#[must_use]
pub fn inject_client(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut from = 0;
    while let Some(idx) = lower[from..].find("<head").map(|i| i + from) {
        let after = idx + "<head".len();
        let is_head = lower[after..]
            .chars()
            .next()
            .is_some_and(|c| c == '>' || c.is_ascii_whitespace());
        if is_head {
            if let Some(close) = lower[after..].find('>') {
                let at = after + close + 1;
                return format!("{}\n    {CLIENT_TAG}{}", &html[..at], &html[at..]);
            }
        }
        from = after;
    }
    format!("{CLIENT_TAG}\n{html}")
}

// ============================================================================
// WebSocket HMR
// ============================================================================

fn offers_hmr(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == HMR_PROTOCOL)
}

fn hmr_upgrade(state: &DevState, headers: &HeaderMap, ws: WebSocketUpgrade) -> Response {
    if !offers_hmr(headers) {
        debug!("rejected websocket without the hmr protocol");
        return (
            StatusCode::BAD_REQUEST,
            "expected websocket sub-protocol \"hmr\"",
        )
            .into_response();
    }
    let rx = state.broadcaster.subscribe();
    ws.protocols([HMR_PROTOCOL])
        .on_upgrade(move |socket| hmr_session(socket, rx))
}

async fn hmr_session(mut socket: WebSocket, mut rx: broadcast::Receiver<Arc<str>>) {
    let Ok(hello) = HmrPayload::Connected.encode() else {
        return;
    };
    if socket.send(Message::Text(hello)).await.is_err() {
        return;
    }
    debug!("hmr client connected");

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(text) => {
                    if let Err(e) = socket.send(Message::Text(text.to_string())).await {
                        debug!(error = %e, "dropping hmr client");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "hmr client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "hmr socket error");
                    break;
                }
            },
        }
    }
    debug!("hmr client disconnected");
}
