use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::dispatch::DeliveryOutcome;
use crate::socket::handle_socket;
use crate::state::Hub;
use fleet_core::{ControlError, HvncSession, HvncSettings, PeerRole, Task, TaskState};
use fleet_store::StoreError;

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/command/send-script-to-client", post(send_command))
        .route("/task", get(list_tasks))
        .route("/task/:task_id", get(get_task))
        .route("/task/:task_id/retry", post(retry_task))
        .route("/task/:task_id/cancel", post(cancel_task))
        .route("/hvnc/:identity/start", post(hvnc_start))
        .route("/hvnc/:identity/stop", post(hvnc_stop))
        .route("/debug/connections", get(debug_connections))
        .with_state(hub)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let status = match &err {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            ControlError::CapabilityUnsupported { .. } => StatusCode::BAD_REQUEST,
            ControlError::OfflineTarget(_) => StatusCode::CONFLICT,
            ControlError::TransportSendFailure(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self {
                status: StatusCode::NOT_FOUND,
                message: format!("task not found: {id}"),
            },
            StoreError::Control(inner) => inner.into(),
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(hub, socket, addr).await;
    })
}

#[derive(Debug, Deserialize)]
pub struct SendCommandRequest {
    pub identity: String,
    pub command: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, rename = "originalCommand")]
    pub original_command: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub task: Task,
    pub delivery: DeliveryOutcome,
}

async fn send_command(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<SendCommandRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    if request.identity.trim().is_empty() || request.command.trim().is_empty() {
        return Err(ApiError::bad_request("identity and command are required"));
    }
    let task = hub.store.create(
        &request.identity,
        &request.command,
        request.params,
        request.original_command,
        request.platform,
    )?;
    hub.broadcast_task_created(&task).await;

    let (task, delivery) = hub.dispatch(&task.task_id).await?;
    Ok(Json(CommandResponse { task, delivery }))
}

async fn get_task(
    State(hub): State<Arc<Hub>>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(hub.store.get(&task_id)?))
}

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    #[serde(default, rename = "agentIdentity")]
    pub agent_identity: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

async fn list_tasks(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let state = match query.state.as_deref() {
        Some(raw) => Some(TaskState::from_str(raw).map_err(ApiError::bad_request)?),
        None => None,
    };
    Ok(Json(hub.store.list(query.agent_identity.as_deref(), state)?))
}

async fn retry_task(
    State(hub): State<Arc<Hub>>,
    Path(task_id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let task = hub.store.retry(&task_id)?;
    hub.broadcast_task_updated(&task).await;
    let (task, delivery) = hub.dispatch(&task.task_id).await?;
    Ok(Json(CommandResponse { task, delivery }))
}

async fn cancel_task(
    State(hub): State<Arc<Hub>>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task = hub.store.cancel(&task_id, Utc::now())?;
    hub.broadcast_task_updated(&task).await;
    Ok(Json(task))
}

async fn hvnc_start(
    State(hub): State<Arc<Hub>>,
    Path(identity): Path<String>,
    settings: Option<Json<HvncSettings>>,
) -> Result<Json<HvncSession>, ApiError> {
    let settings = settings.map(|Json(inner)| inner).unwrap_or_default();
    Ok(Json(hub.hvnc_start(&identity, settings).await?))
}

async fn hvnc_stop(
    State(hub): State<Arc<Hub>>,
    Path(identity): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match hub.hvnc_stop(&identity).await {
        Some(session) => Ok(Json(json!({ "stopped": session.session_id }))),
        None => Ok(Json(json!({ "stopped": Value::Null }))),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerSummary {
    identity: String,
    role: PeerRole,
    conn_id: u64,
    platform: Option<String>,
    capabilities: Vec<String>,
    registered_at: DateTime<Utc>,
}

async fn debug_connections(State(hub): State<Arc<Hub>>) -> Json<Value> {
    let stats = hub.registry.stats().await;
    let mut peers = Vec::new();
    for role in [PeerRole::Agent, PeerRole::Admin] {
        for handle in hub.registry.list_by_role(role).await {
            peers.push(PeerSummary {
                identity: handle.identity.clone(),
                role: handle.role,
                conn_id: handle.conn_id,
                platform: handle.platform.clone(),
                capabilities: handle.capabilities.clone(),
                registered_at: handle.registered_at,
            });
        }
    }
    Json(json!({
        "agentCount": stats.agent_count,
        "adminCount": stats.admin_count,
        "peers": peers,
    }))
}
