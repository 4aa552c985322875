//! Streamable HTTP transport for cai-mcp
//! JSON-only flavour of the MCP 2025-06-18 HTTP transport: every POST gets
//! one JSON answer, no server-initiated streams.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use headers::{HeaderMapExt, Origin};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::websocket::handle_websocket;
use crate::config::HttpConfig;
use crate::metrics;
use crate::protocol::{JsonRpcError, JsonRpcResponse, PARSE_ERROR, SUPPORTED_PROTOCOL_VERSIONS};
use crate::router::McpRouter;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// MCP client session on the HTTP transport
#[derive(Debug, Clone)]
struct HttpSession {
    last_activity: Instant,
}

impl HttpSession {
    fn new() -> Self {
        Self {
            last_activity: Instant::now(),
        }
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub(crate) router: Arc<McpRouter>,
    sessions: Arc<Mutex<HashMap<String, HttpSession>>>,
    config: HttpConfig,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub(crate) fn new(router: Arc<McpRouter>, config: HttpConfig) -> Self {
        Self {
            router,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
            started_at: Utc::now(),
        }
    }
}

/// HTTP transport server
pub struct HttpTransport {
    config: HttpConfig,
    router: Arc<McpRouter>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig, router: Arc<McpRouter>) -> Self {
        Self { config, router }
    }

    /// Start the HTTP server
    pub async fn start(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let state = AppState::new(self.router, self.config);

        // Start session cleanup task
        let cleanup_state = state.clone();
        tokio::spawn(async move {
            session_cleanup_task(cleanup_state).await;
        });

        let app = app(state);

        info!("HTTP transport listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

pub(crate) fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin.to_str().map(is_local_origin).unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .route("/ws", get(handle_websocket))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Handle POST /mcp - client sends one JSON-RPC message
async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    let result = post_inner(&state, &headers, &body).await;
    let status = match &result {
        Ok(response) => response.status(),
        Err(status) => *status,
    };
    metrics::record_http_request("POST", "/mcp", status.as_u16());
    result
}

async fn post_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, StatusCode> {
    validate_origin(headers)?;

    // Absent header means the client predates version negotiation
    if let Some(version) = headers
        .get(PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            warn!("Unsupported protocol version: {}", version);
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let json_value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            let error = JsonRpcResponse::failure(
                None,
                JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e)),
            );
            return Ok((StatusCode::BAD_REQUEST, Json(error)).into_response());
        }
    };

    let is_initialize = json_value.get("method").and_then(|m| m.as_str()) == Some("initialize");

    let session_id = if is_initialize {
        let sid = Uuid::new_v4().to_string();
        let mut sessions = state.sessions.lock().await;
        sessions.insert(sid.clone(), HttpSession::new());
        metrics::set_active_client_sessions(sessions.len());
        info!("New MCP client session {}", sid);
        sid
    } else {
        let sid = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::BAD_REQUEST)?;
        let mut sessions = state.sessions.lock().await;
        sessions
            .get_mut(sid)
            .ok_or(StatusCode::NOT_FOUND)?
            .touch();
        sid.to_string()
    };

    let mut response = match state.router.handle_message(body).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };

    if is_initialize {
        let value =
            HeaderValue::from_str(&session_id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }

    Ok(response)
}

/// Handle DELETE /mcp - client ends its session
async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let status = match headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        None => StatusCode::BAD_REQUEST,
        Some(sid) => {
            let mut sessions = state.sessions.lock().await;
            if sessions.remove(sid).is_some() {
                metrics::set_active_client_sessions(sessions.len());
                debug!("Client ended session {}", sid);
                StatusCode::NO_CONTENT
            } else {
                StatusCode::NOT_FOUND
            }
        }
    };
    metrics::record_http_request("DELETE", "/mcp", status.as_u16());
    status
}

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.lock().await.len();
    let platform_session = state.router.session_live().await;
    metrics::record_http_request("GET", "/health", 200);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "client_sessions": sessions,
        "platform_session": platform_session,
        "started_at": state.started_at.to_rfc3339(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

async fn handle_metrics() -> Response {
    match metrics::export_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to export metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn is_local_origin(origin: &str) -> bool {
    if origin == "null" {
        return true;
    }
    let host = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let host = match host.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or(""),
        None => host.split(':').next().unwrap_or(""),
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Validate Origin header to prevent DNS rebinding attacks
pub(super) fn validate_origin(headers: &HeaderMap) -> Result<(), StatusCode> {
    match headers.typed_get::<Origin>() {
        Some(origin) if !is_local_origin(&origin.to_string()) => {
            warn!("Rejected non-localhost origin: {}", origin);
            Err(StatusCode::FORBIDDEN)
        }
        // No origin header: non-browser clients don't send one
        _ => Ok(()),
    }
}

/// Background task to cleanup expired sessions
async fn session_cleanup_task(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));

    loop {
        interval.tick().await;
        expire_sessions(&state).await;
    }
}

async fn expire_sessions(state: &AppState) -> usize {
    let timeout = Duration::from_secs(state.config.session_timeout_secs);
    let mut sessions = state.sessions.lock().await;
    let before = sessions.len();

    sessions.retain(|id, session| {
        let keep = !session.is_expired(timeout);
        if !keep {
            info!("Cleaning up expired session: {}", id);
        }
        keep
    });

    metrics::set_active_client_sessions(sessions.len());
    before - sessions.len()
}
