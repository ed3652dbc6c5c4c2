use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentEvent, AgentHandle, AgentStatus, RunState};
use crate::runtime::BackendRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub handle: AgentHandle,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct SubmitInputRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct SubmitInputResponse {
    accepted: bool,
}

#[derive(Debug, Deserialize)]
struct ThoughtDelayRequest {
    millis: u64,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    state: RunState,
}

pub async fn serve_backend(
    mut runtime: BackendRuntime,
    event_rx: flume::Receiver<AgentEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("REVERIE_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid REVERIE_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        handle: runtime.handle.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    let agent_thread = runtime.spawn_agent_loop()?;

    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Reverie backend listening on http://{}", bind_addr);

    let handle = runtime.handle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { handle.terminated().await })
        .await
        .context("Backend server failed")?;

    runtime.handle.shutdown();
    tokio::task::spawn_blocking(move || agent_thread.join())
        .await
        .context("Failed to wait for agent thread")?
        .map_err(|_| anyhow!("Agent thread panicked"))?;
    tracing::info!("Reverie backend stopped");
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/agent/status", get(get_agent_status))
        .route("/agent/start", post(start_agent))
        .route("/agent/pause", post(pause_agent))
        .route("/agent/toggle", post(toggle_agent))
        .route("/agent/end-session", post(end_session))
        .route("/agent/shutdown", post(shutdown_agent))
        .route("/agent/thought-delay", put(set_thought_delay))
        .route("/input", post(submit_input))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<AgentEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_agent_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_agent_event(event: AgentEvent) -> ApiEventEnvelope {
    match event {
        AgentEvent::Thought { text, tag } => envelope(
            "thought",
            serde_json::json!({ "text": text, "tag": tag }),
        ),
        AgentEvent::Speech {
            text,
            sender,
            complete,
        } => envelope(
            "speech",
            serde_json::json!({
                "text": text,
                "sender": sender,
                "complete": complete
            }),
        ),
        AgentEvent::StateChanged(state) => {
            envelope("state_changed", serde_json::json!({ "state": state }))
        }
        AgentEvent::Pruned { removed_chars } => envelope(
            "pruned",
            serde_json::json!({ "removed_chars": removed_chars }),
        ),
        AgentEvent::MemorySaved { id } => {
            envelope("memory_saved", serde_json::json!({ "id": id }))
        }
        AgentEvent::Error(error) => envelope("error", serde_json::json!({ "error": error })),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

const AUTH_MODE_VAR: &str = "REVERIE_BACKEND_AUTH_MODE";
const TOKEN_VAR: &str = "REVERIE_BACKEND_TOKEN";

fn load_auth_config() -> Result<BackendAuthConfig> {
    auth_config_from(|key| std::env::var(key).ok())
}

fn auth_config_from(lookup: impl Fn(&str) -> Option<String>) -> Result<BackendAuthConfig> {
    let mode = match lookup(AUTH_MODE_VAR).as_deref().map(str::trim) {
        None | Some("") => AuthMode::Required,
        Some(raw) if raw.eq_ignore_ascii_case("required") => AuthMode::Required,
        Some(raw) if raw.eq_ignore_ascii_case("disabled") => AuthMode::Disabled,
        Some(other) => {
            return Err(anyhow!(
                "{} must be 'required' or 'disabled', got '{}'",
                AUTH_MODE_VAR,
                other
            ))
        }
    };
    let token = lookup(TOKEN_VAR)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!("{} must be set to serve the API", TOKEN_VAR));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("API auth disabled; every route is open on the bind address");
    }
    Ok(BackendAuthConfig { mode, token })
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "));
    match (presented, auth.token.as_deref()) {
        (Some(presented), Some(expected)) if presented.trim() == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_agent_status(State(state): State<Arc<ServerState>>) -> Json<AgentStatus> {
    Json(state.handle.status())
}

async fn start_agent(State(state): State<Arc<ServerState>>) -> Json<StateResponse> {
    state.handle.start();
    Json(StateResponse {
        state: state.handle.state(),
    })
}

async fn pause_agent(State(state): State<Arc<ServerState>>) -> Json<StateResponse> {
    state.handle.pause();
    Json(StateResponse {
        state: state.handle.state(),
    })
}

async fn toggle_agent(State(state): State<Arc<ServerState>>) -> Json<StateResponse> {
    Json(StateResponse {
        state: state.handle.toggle(),
    })
}

async fn end_session(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.handle.end_session();
    StatusCode::ACCEPTED
}

async fn shutdown_agent(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.handle.shutdown();
    StatusCode::ACCEPTED
}

async fn set_thought_delay(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ThoughtDelayRequest>,
) -> Json<AgentStatus> {
    state
        .handle
        .set_thought_delay(Duration::from_millis(body.millis));
    Json(state.handle.status())
}

async fn submit_input(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SubmitInputRequest>,
) -> Result<Json<SubmitInputResponse>, (StatusCode, String)> {
    if !state.handle.submit_user_text(&body.text) {
        return Err((StatusCode::BAD_REQUEST, "text must not be blank".to_string()));
    }
    Ok(Json(SubmitInputResponse { accepted: true }))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Websocket client lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
