// SPDX-License-Identifier: MIT

//! HTTP surface for a workflow
//!
//! Requests matching `settings.apiServer.routes` run the workflow's target
//! and answer with a JSON envelope. The active workflow lives behind an
//! [`ArcSwap`] so hot reload never blocks or disturbs in-flight requests.

pub mod reload;

use crate::engine::{route_matches, Engine, ExecutionOutput, RequestContext, UploadedFile};
use crate::error::{error_chain, EngineError, ErrorKind};
use crate::workflow::Workflow;
use anyhow::Context;
use arc_swap::ArcSwap;
use axum::{
    extract::{ConnectInfo, FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

pub const SESSION_COOKIE: &str = "agentrun_session";
pub const SESSION_HEADER: &str = "x-session-id";

const BODY_LIMIT: usize = 10 * 1024 * 1024;
/// Extra time given to cancelled executions before the server task is aborted
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Shared server state
pub struct AppState {
    workflow: ArcSwap<Workflow>,
    engine: Engine,
    /// Parent of every request's cancellation token
    executions: CancellationToken,
    upload_dir: PathBuf,
}

impl AppState {
    pub fn new(workflow: Workflow, engine: Engine) -> Self {
        Self {
            workflow: ArcSwap::from_pointee(workflow),
            engine,
            executions: CancellationToken::new(),
            upload_dir: std::env::temp_dir().join("agentrun-uploads"),
        }
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    /// Snapshot of the active workflow
    pub fn workflow(&self) -> Arc<Workflow> {
        self.workflow.load_full()
    }

    pub fn swap_workflow(&self, workflow: Workflow) {
        self.workflow.store(Arc::new(workflow));
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Cancel every in-flight execution
    pub fn cancel_executions(&self) {
        self.executions.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub grace_period: Duration,
    /// Workflow file to watch for hot reload
    pub watch: Option<PathBuf>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new().route("/health", get(health_check));

    if let Some(web) = &state.workflow().settings.web_server {
        for route in &web.routes {
            if route.path == "/" || !route.path.starts_with('/') {
                log::warn!("Skipping static route '{}': needs a sub-path", route.path);
                continue;
            }
            log::info!("Serving {} from {}", route.path, route.public_path);
            app = app.nest_service(&route.path, ServeDir::new(&route.public_path));
        }
    }

    app.fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` fires
pub async fn serve(
    state: Arc<AppState>,
    options: ServeOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", options.host, options.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    serve_on(listener, state, options, shutdown).await
}

/// Serve on an already-bound listener. After `shutdown` fires, in-flight
/// requests get `grace_period` to finish before they are cancelled.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    options: ServeOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Listening on http://{}", listener.local_addr()?);

    if let Some(path) = options.watch.clone() {
        let watch_state = state.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = reload::watch(path, watch_state, token).await {
                log::error!("Hot reload disabled: {}", e);
            }
        });
    }

    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let signal = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server => return finish(result),
        _ = shutdown.cancelled() => {}
    }

    log::info!(
        "Shutting down; waiting up to {:?} for in-flight requests",
        options.grace_period
    );
    if let Ok(result) = tokio::time::timeout(options.grace_period, &mut server).await {
        return finish(result);
    }

    log::warn!("Grace period elapsed; cancelling in-flight executions");
    state.cancel_executions();
    if let Ok(result) = tokio::time::timeout(FORCE_CLOSE_WAIT, &mut server).await {
        return finish(result);
    }
    server.abort();
    log::warn!("Server did not stop in time; connections force-closed");
    Ok(())
}

fn finish(result: Result<std::io::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    result
        .context("server task failed")?
        .context("server error")?;
    log::info!("Server stopped");
    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "workflow": state.workflow().metadata.name,
    }))
}

enum RouteMatch {
    Matched,
    NotFound,
    MethodNotAllowed,
}

/// Without `apiServer` settings every path reaches the target
fn match_route(workflow: &Workflow, method: &str, path: &str) -> RouteMatch {
    let Some(api) = &workflow.settings.api_server else {
        return RouteMatch::Matched;
    };
    let mut path_seen = false;
    for route in &api.routes {
        if !route_matches(&route.path, path) {
            continue;
        }
        path_seen = true;
        if route.methods.is_empty() || route.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return RouteMatch::Matched;
        }
    }
    if path_seen {
        RouteMatch::MethodNotAllowed
    } else {
        RouteMatch::NotFound
    }
}

async fn handle_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let workflow = state.workflow();
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    match match_route(&workflow, &method, &path) {
        RouteMatch::Matched => {}
        RouteMatch::NotFound => {
            return plain_error(StatusCode::NOT_FOUND, format!("no route for {}", path))
        }
        RouteMatch::MethodNotAllowed => {
            return plain_error(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("{} not allowed on {}", method, path),
            )
        }
    }

    let mut ctx = match request_context(&state, request).await {
        Ok(ctx) => ctx,
        Err(e) => {
            let mut ctx = RequestContext::new(&method, &path);
            ctx.ensure_session_id();
            return respond(Err(e), &ctx);
        }
    };

    let result = state
        .engine
        .execute_with_cancel(&workflow, Some(&mut ctx), state.executions.child_token())
        .await;
    respond(result, &ctx)
}

/// Build the engine's view of an HTTP request
async fn request_context(
    state: &Arc<AppState>,
    request: Request,
) -> Result<RequestContext, EngineError> {
    let mut ctx = RequestContext::new(request.method().as_str(), request.uri().path());
    let headers = request.headers().clone();

    for (name, value) in &headers {
        if let Ok(v) = value.to_str() {
            ctx.headers.insert(name.as_str().to_string(), v.to_string());
        }
    }
    if let Some(query) = request.uri().query() {
        ctx.query = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect::<BTreeMap<_, _>>();
    }
    ctx.ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .or_else(|| {
            header_str(&headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
        })
        .unwrap_or_default();
    if let Some(id) = header_str(&headers, "x-request-id") {
        ctx.id = id.to_string();
    }
    ctx.session_id = session_from(&headers).unwrap_or_default();

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if content_type.starts_with("multipart/form-data") {
        let (fields, files) = read_multipart(state, request).await?;
        ctx.body = Value::Object(fields);
        ctx.files = files;
        return Ok(ctx);
    }

    let bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
        .await
        .map_err(|e| EngineError::RequestContextType(format!("failed to read body: {}", e)))?;
    ctx.body = parse_body(&content_type, &bytes)?;
    Ok(ctx)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Session id from the `X-Session-ID` header, else the session cookie.
/// Ids outside [`valid_session_id`] are ignored so a fresh one gets minted.
fn session_from(headers: &HeaderMap) -> Option<String> {
    let from_header = header_str(headers, SESSION_HEADER)
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value);

    from_header
        .into_iter()
        .chain(from_cookie)
        .find(|id| {
            let ok = valid_session_id(id);
            if !ok {
                log::warn!("Ignoring malformed session id ({} bytes)", id.len());
            }
            ok
        })
        .map(str::to_string)
}

/// At most 128 ASCII letters, digits, `-` or `_`
fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn parse_body(content_type: &str, bytes: &[u8]) -> Result<Value, EngineError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    if content_type.starts_with("application/json") || content_type.contains("+json") {
        return serde_json::from_slice(bytes)
            .map_err(|e| EngineError::RequestContextType(format!("invalid JSON body: {}", e)));
    }
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let form: Map<String, Value> = url::form_urlencoded::parse(bytes)
            .into_owned()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        return Ok(Value::Object(form));
    }
    let text = String::from_utf8_lossy(bytes);
    Ok(serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned())))
}

async fn read_multipart(
    state: &Arc<AppState>,
    request: Request,
) -> Result<(Map<String, Value>, Vec<UploadedFile>), EngineError> {
    let bad = |msg: String| EngineError::RequestContextType(msg);
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| bad(e.body_text()))?;

    let mut fields = Map::new();
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| bad(e.body_text()))? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let mime_type = field.content_type().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(|e| bad(e.body_text()))?;

        match filename {
            Some(filename) => {
                let saved = save_upload(&state.upload_dir, &filename, &data)
                    .await
                    .map_err(|e| bad(format!("failed to store upload: {}", e)))?;
                files.push(UploadedFile {
                    name,
                    filename,
                    path: saved.to_string_lossy().into_owned(),
                    mime_type,
                    size: data.len() as u64,
                });
            }
            None => {
                fields.insert(
                    name,
                    Value::String(String::from_utf8_lossy(&data).into_owned()),
                );
            }
        }
    }
    Ok((fields, files))
}

async fn save_upload(dir: &Path, filename: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), base));
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

/// HTTP status for an engine failure
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::PreflightFailed { code, .. } => {
            StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_REQUEST)
        }
        _ => match err.kind() {
            ErrorKind::RequestContextType => StatusCode::BAD_REQUEST,
            ErrorKind::TargetNotExecuted => StatusCode::NOT_FOUND,
            ErrorKind::ExecutorNotAvailable => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::ExecutorExecution => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn respond(result: Result<ExecutionOutput, EngineError>, ctx: &RequestContext) -> Response {
    let mut response = match result {
        Ok(out) => {
            let status = out
                .meta
                .status_code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(if out.success {
                    StatusCode::OK
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                });
            let body = json!({
                "success": out.success,
                "data": out.value,
                "meta": {
                    "requestId": ctx.id,
                    "sessionId": out.session_id,
                    "actionId": out.action_id,
                },
            });
            let mut response = (status, Json(body)).into_response();
            for (name, value) in &out.meta.headers {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(n), Ok(v)) => {
                        response.headers_mut().insert(n, v);
                    }
                    _ => log::warn!("Dropping invalid response header '{}'", name),
                }
            }
            response
        }
        Err(e) => {
            let status = status_for(&e);
            let message = error_chain(&e);
            if status.is_server_error() {
                log::error!("Request {} failed: {}", ctx.id, message);
            } else {
                log::warn!("Request {} rejected: {}", ctx.id, message);
            }
            let body = json!({
                "success": false,
                "error": {
                    "kind": e.kind(),
                    "actionId": e.action_id(),
                    "message": message,
                },
                "meta": {
                    "requestId": ctx.id,
                    "sessionId": ctx.session_id,
                },
            });
            (status, Json(body)).into_response()
        }
    };

    attach_session(response.headers_mut(), &ctx.session_id);
    response
}

fn attach_session(headers: &mut HeaderMap, session_id: &str) {
    if !valid_session_id(session_id) {
        return;
    }
    let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, session_id);
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        headers.append(header::SET_COOKIE, v);
    }
    if let Ok(v) = HeaderValue::from_str(session_id) {
        headers.insert(SESSION_HEADER, v);
    }
}

fn plain_error(status: StatusCode, message: String) -> Response {
    let body = json!({
        "success": false,
        "error": {"kind": "routing", "actionId": null, "message": message},
    });
    (status, Json(body)).into_response()
}
