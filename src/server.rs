use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{AgentDefinition, AgentType, UserProfile};
use crate::error::{HubError, HubResult};
use crate::mcp::executor::ToolExecutor;
use crate::mcp::{McpToolCall, McpToolResult};
use crate::orchestrator::SessionOrchestrator;
use crate::session::{AgentSession, ChatMessage, SessionStatus};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SessionOrchestrator,
    pub executor: ToolExecutor,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    code: &'static str,
}

pub enum ApiError {
    Hub(HubError),
    BadRequest(String),
    Internal(String),
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError::Hub(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Hub(err) => {
                let (status, code) = match &err {
                    HubError::UnknownAgent(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_AGENT"),
                    HubError::NoClientRegistered(_) => (StatusCode::SERVICE_UNAVAILABLE, "NO_TOOL_CLIENT"),
                    HubError::SessionConflict(_) => (StatusCode::CONFLICT, "SESSION_CONFLICT"),
                    HubError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    HubError::Completion(_) => (StatusCode::BAD_GATEWAY, "COMPLETION_FAILED"),
                    HubError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_FAILED"),
                    HubError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "CANCELLED"),
                };
                (status, code, err.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };
        if status.is_server_error() {
            error!(status = %status, code, error = %message, "request failed");
        }
        (status, Json(ApiErrorBody { error: message, code })).into_response()
    }
}

fn parse_agent_type(raw: &str) -> Result<AgentType, ApiError> {
    raw.parse().map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))
}

/// Runs `work` on its own task. If the request is abandoned before it finishes,
/// the token handed to `work` is cancelled so the turn can settle itself.
async fn detached<T, F, Fut>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = HubResult<T>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let abandoned = cancel.clone().drop_guard();
    let joined = tokio::spawn(work(cancel)).await;
    abandoned.disarm();
    Ok(joined.map_err(|e| ApiError::Internal(format!("request task failed: {}", e)))??)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub user_id: String,
    pub agent_type: AgentType,
    pub agent_name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: usize,
}

impl From<&AgentSession> for SessionResponse {
    fn from(s: &AgentSession) -> Self {
        Self {
            session_id: s.id,
            user_id: s.user_id.clone(),
            agent_type: s.agent_type,
            agent_name: s.agent.name.clone(),
            status: s.status,
            created_at: s.created_at,
            last_activity_at: s.last_activity_at,
            message_count: s.messages.len(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub user_id: String,
    pub agent_type: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_type: AgentType,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn readiness(State(state): State<AppState>) -> Json<serde_json::Value> {
    let agents: BTreeMap<AgentType, bool> = state.orchestrator.gateway().health_status().await;
    let status = if agents.values().all(|healthy| *healthy) { "Ready" } else { "Degraded" };
    Json(json!({ "status": status, "agents": agents }))
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.as_ref().map(|h| h.render()).ok_or(StatusCode::NOT_FOUND)
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentDefinition>> {
    Json(state.orchestrator.catalog().all().to_vec())
}

async fn agents_for_user(State(state): State<AppState>, Json(user): Json<UserProfile>) -> Json<Vec<AgentDefinition>> {
    Json(state.orchestrator.catalog().for_user(&user).into_iter().cloned().collect())
}

async fn agent_health(State(state): State<AppState>, Path(raw): Path<String>) -> Result<Json<AgentHealth>, ApiError> {
    let agent_type = parse_agent_type(&raw)?;
    let client = state.orchestrator.gateway().client(agent_type)?;
    let health = match client.is_healthy().await {
        Ok(healthy) => AgentHealth { agent_type, healthy, error: None },
        Err(err) => {
            warn!(agent = %agent_type, error = %err, "health probe failed");
            AgentHealth { agent_type, healthy: false, error: Some(err.to_string()) }
        }
    };
    Ok(Json(health))
}

async fn call_tool(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Json(call): Json<McpToolCall>,
) -> Result<Json<McpToolResult>, ApiError> {
    let agent_type = parse_agent_type(&raw)?;
    let executor = state.executor.clone();
    let result = detached(move |cancel| async move { Ok(executor.execute(agent_type, &call, &cancel).await) }).await?;
    Ok(Json(result))
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let agent_type = parse_agent_type(&body.agent_type)?;
    let orchestrator = state.orchestrator.clone();
    let session = detached(move |cancel| async move {
        orchestrator.create_session(&body.user_id, agent_type, &cancel).await
    })
    .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

async fn load_session(state: &AppState, id: Uuid) -> Result<AgentSession, ApiError> {
    let orchestrator = state.orchestrator.clone();
    detached(move |cancel| async move {
        orchestrator.get_session(id, &cancel).await?.ok_or(HubError::SessionNotFound(id))
    })
    .await
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<SessionResponse>, ApiError> {
    let session = load_session(&state, id).await?;
    Ok(Json(SessionResponse::from(&session)))
}

async fn get_messages(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let session = load_session(&state, id).await?;
    Ok(Json(session.messages))
}

async fn end_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    let orchestrator = state.orchestrator.clone();
    detached(move |cancel| async move { orchestrator.end_session(id, &cancel).await }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn user_sessions(State(state): State<AppState>, Path(user_id): Path<String>) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let orchestrator = state.orchestrator.clone();
    let sessions = detached(move |cancel| async move { orchestrator.sessions_for_user(&user_id, &cancel).await }).await?;
    Ok(Json(sessions.iter().map(SessionResponse::from).collect()))
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<ChatMessage>, ApiError> {
    let orchestrator = state.orchestrator.clone();
    let reply = detached(move |cancel| async move { orchestrator.process_message(id, &body.content, &cancel).await }).await?;
    Ok(Json(reply))
}

fn sse_event(kind: &'static str, payload: serde_json::Value) -> Event {
    Event::default().event(kind).data(payload.to_string())
}

async fn stream_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let orchestrator = state.orchestrator.clone();
    let tokens = detached(move |cancel| async move { orchestrator.stream_message(id, &body.content, cancel).await }).await?;
    info!(session = %id, "streaming reply");

    let events = tokens
        .map(|item| match item {
            Ok(token) => sse_event("token", json!({ "content": token })),
            Err(err) => sse_event("error", json!({ "error": err.to_string() })),
        })
        .chain(stream::once(async { sse_event("done", json!({})) }))
        .map(Ok::<_, Infallible>);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(render_metrics))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/for-user", post(agents_for_user))
        .route("/api/agents/:agent_type/health", get(agent_health))
        .route("/api/agents/:agent_type/tools/call", post(call_tool))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(end_session))
        .route("/api/sessions/:id/messages", get(get_messages).post(send_message))
        .route("/api/sessions/:id/stream", post(stream_message))
        .route("/api/users/:user_id/sessions", get(user_sessions))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "ops hub listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
