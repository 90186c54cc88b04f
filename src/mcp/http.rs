//! MCP transport over HTTP with server-sent-event sessions
//!
//! A client opens `GET /sse`; the first event on the stream carries the
//! session id. Requests arrive as `POST /message?sessionId=…` and their
//! responses are pushed as events on the originating stream. The CORS
//! allow-list is built before any route is attached, and a session's
//! disconnect cancels whatever call is in flight for it.

use super::auth::OAuthValidator;
use super::McpServer;
use crate::config::McpHttpConfig;
use crate::error::Result;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SESSION_QUEUE: usize = 64;

struct SessionHandle {
    tx: mpsc::Sender<String>,
    last_seen: Instant,
}

/// Shared state for the HTTP transport
#[derive(Clone)]
pub struct McpHttpState {
    server: Arc<McpServer>,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    config: McpHttpConfig,
    validator: Option<Arc<OAuthValidator>>,
}

impl McpHttpState {
    pub fn new(server: Arc<McpServer>, config: McpHttpConfig) -> Self {
        let validator = config
            .oauth
            .enabled
            .then(|| OAuthValidator::from_config(&config.oauth).map(Arc::new))
            .flatten();

        Self {
            server,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
            validator,
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session_timeout_minutes.max(1) * 60)
    }

    /// Register a new session and return its id plus the outbound queue.
    pub async fn open_session(&self) -> (String, mpsc::Receiver<String>) {
        self.sweep_idle().await;

        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionHandle {
                tx,
                last_seen: Instant::now(),
            },
        );
        info!(session_id = %session_id, "MCP session opened");
        (session_id, rx)
    }

    /// Handle one posted JSON-RPC message for a session. The response is
    /// pushed on the session stream; a vanished session cancels the call.
    pub async fn post_message(&self, session_id: &str, body: String) -> StatusCode {
        let tx = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(session) => {
                    session.last_seen = Instant::now();
                    session.tx.clone()
                }
                None => return StatusCode::NOT_FOUND,
            }
        };

        let server = self.server.clone();
        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            tokio::select! {
                // Client went away: abandon the in-flight call
                _ = tx.closed() => {
                    debug!(session_id = %session_id, "Session closed mid-call");
                }
                response = server.handle_line(&body) => {
                    if let Some(response) = response {
                        if tx.send(response).await.is_err() {
                            warn!(session_id = %session_id, "Session queue gone; dropping session");
                            sessions.lock().await.remove(&session_id);
                        }
                    }
                }
            }
        });

        StatusCode::ACCEPTED
    }

    pub async fn close_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn sweep_idle(&self) {
        let timeout = self.idle_timeout();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|session_id, session| {
            let keep = session.last_seen.elapsed() < timeout;
            if !keep {
                debug!(session_id = %session_id, "Dropping idle MCP session");
            }
            keep
        });
    }

    async fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };

        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        validator
            .validate(token)
            .await
            .map_err(|_| StatusCode::UNAUTHORIZED)
    }
}

/// Build the transport router. The CORS allow-list is constructed first and
/// layered over the routes, so preflight handling is in place before any
/// request is routed.
pub fn router(state: McpHttpState) -> Router {
    let cors = cors_layer(&state.config);

    let router = Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .with_state(state);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// Bind and serve the transport.
pub async fn serve(state: McpHttpState) -> Result<()> {
    if let Some(validator) = &state.validator {
        if let Err(e) = validator.refresh().await {
            warn!(error = %e, "JWKS discovery failed; bearer tokens will be rejected until it succeeds");
        }
    }

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "MCP HTTP transport listening");

    // Idle sessions are also swept in the background so long-lived
    // processes do not accumulate dead streams
    let sweeper_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweeper_state.sweep_idle().await;
        }
    });

    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn cors_layer(config: &McpHttpConfig) -> Option<tower_http::cors::CorsLayer> {
    if !config.cors.enabled {
        return None;
    }

    let origins: Vec<HeaderValue> = config
        .cors
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let layer = tower_http::cors::CorsLayer::new().allow_methods([Method::GET, Method::POST]);

    // Credentials cannot be combined with wildcard origins or headers
    let layer = if config.cors.allow_credentials && !origins.is_empty() {
        layer
            .allow_origin(origins)
            .allow_credentials(true)
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
            ])
    } else if origins.is_empty() {
        layer
            .allow_origin(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    } else {
        layer
            .allow_origin(origins)
            .allow_headers(tower_http::cors::Any)
    };

    Some(layer)
}

async fn sse_handler(
    State(state): State<McpHttpState>,
    headers: HeaderMap,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, StatusCode>
{
    state.authorize(&headers).await?;

    let (session_id, mut rx) = state.open_session().await;
    let keepalive_secs = 15;

    let stream = async_stream::stream! {
        // The session id must be the first event on the stream
        yield Ok(Event::default()
            .event("endpoint")
            .data(format!("/message?sessionId={session_id}")));

        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("message").data(message));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(keepalive_secs))
            .text("ping"),
    ))
}

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn message_handler(
    State(state): State<McpHttpState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(status) = state.authorize(&headers).await {
        return (status, Json(json!({"error": {"kind": "Unauthorized"}}))).into_response();
    }

    let status = state.post_message(&query.session_id, body).await;
    if status == StatusCode::NOT_FOUND {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"kind": "NotFound", "message": "unknown session"}})),
        )
            .into_response()
    } else {
        (status, Json(json!({"status": "accepted"}))).into_response()
    }
}
