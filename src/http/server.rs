use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use super::ApiEnvelope;
use crate::coordinator::{Coordinator, DashboardSummary};
use crate::errors::FleetError;
use crate::supervisor::{Supervisor, WorkerStatus};
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use crate::types::{AgentRecord, AgentStatus, Alert, Severity, Task, TaskState, Tier};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub supervisor: Option<Supervisor>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            supervisor: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    fn supervisor(&self) -> Result<&Supervisor, ApiError> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| ApiError(FleetError::not_found("supervisor", "not running in this process")))
    }
}

/// Typed error rendered as an envelope with a matching HTTP code
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(FleetError::invalid(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(FleetError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self.0 {
            FleetError::NotFound { .. } => StatusCode::NOT_FOUND,
            FleetError::Conflict { .. } => StatusCode::CONFLICT,
            FleetError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body: ApiEnvelope<()> = ApiEnvelope {
            status: self.0.status_label().to_string(),
            data: None,
            message: Some(self.0.to_string()),
        };
        (code, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiEnvelope<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiEnvelope::ok(data)))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub agent_id: String,
    pub tier: Tier,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status_hint: Option<AgentStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub agent_id: String,
    pub accepted_types: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub task: Option<Task>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub agent_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub agent_id: String,
    #[serde(default)]
    pub result: serde_json::Value,
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishAlertRequest {
    pub source: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertQuery {
    pub since: Option<DateTime<Utc>>,
    pub min_severity: Option<Severity>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub state: Option<TaskState>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkerQuery {
    pub tier: Option<Tier>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub health: String,
    pub timestamp: DateTime<Utc>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/dashboard-data", get(dashboard))
        .route("/agents", get(list_agents))
        .route("/agents/register", post(register))
        .route("/agents/{id}/heartbeat", post(heartbeat))
        .route("/agents/{id}/deregister", post(deregister))
        .route("/tasks", get(list_tasks).post(enqueue))
        .route("/tasks/claim", post(claim))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/complete", post(complete))
        .route("/alerts", get(query_alerts).post(publish_alert))
        .route("/workers", get(list_workers))
        .route("/workers/{id}", get(worker_status))
        .route("/workers/{id}/start", post(start_worker))
        .route("/workers/{id}/stop", post(stop_worker))
        .route("/workers/{id}/restart", post(restart_worker))
        .route("/workers/{id}/probe", post(probe_worker))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Coordinator API listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    ok(HealthResponse {
        health: "healthy".to_string(),
        timestamp: state.coordinator.now(),
    })
}

async fn dashboard(State(state): State<AppState>) -> ApiResult<DashboardSummary> {
    ok(state.coordinator.dashboard().await)
}

async fn list_agents(State(state): State<AppState>) -> ApiResult<Vec<AgentRecord>> {
    ok(state.coordinator.query_agent_health().await)
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<AgentRecord> {
    let Json(req) = payload?;
    let span = create_coordination_span("register", Some(&req.agent_id), None, Some(&generate_correlation_id()));
    let record = state
        .coordinator
        .register(&req.agent_id, req.tier, req.capabilities)
        .instrument(span)
        .await?;
    ok(record)
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<AgentRecord> {
    let req: HeartbeatRequest = if body.iter().all(u8::is_ascii_whitespace) {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| FleetError::invalid(e.to_string()))?
    };
    ok(state.coordinator.heartbeat(&id, req.status_hint).await?)
}

async fn deregister(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<AgentRecord> {
    ok(state.coordinator.deregister(&id).await?)
}

async fn enqueue(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> ApiResult<Task> {
    let Json(req) = payload?;
    ok(state.coordinator.enqueue_task(&req.task_type, req.payload).await?)
}

async fn claim(
    State(state): State<AppState>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> ApiResult<ClaimResponse> {
    let Json(req) = payload?;
    let span = create_coordination_span("claim_task", Some(&req.agent_id), None, Some(&generate_correlation_id()));
    let task = state
        .coordinator
        .claim_task(&req.agent_id, &req.accepted_types)
        .instrument(span)
        .await?;
    ok(ClaimResponse { task })
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Task> {
    ok(state.coordinator.get_task(&id).await?)
}

async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<TaskQuery>, QueryRejection>,
) -> ApiResult<Vec<Task>> {
    let Query(query) = query?;
    ok(state.coordinator.list_tasks(query.state).await)
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult<Task> {
    let Json(req) = payload?;
    ok(state.coordinator.start_task(&id, &req.agent_id).await?)
}

async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> ApiResult<Task> {
    let Json(req) = payload?;
    let span = create_coordination_span("complete_task", Some(&req.agent_id), Some(&id), Some(&generate_correlation_id()));
    let task = state
        .coordinator
        .complete_task(&id, &req.agent_id, req.result, req.success)
        .instrument(span)
        .await?;
    ok(task)
}

async fn publish_alert(
    State(state): State<AppState>,
    payload: Result<Json<PublishAlertRequest>, JsonRejection>,
) -> ApiResult<Alert> {
    let Json(req) = payload?;
    ok(state
        .coordinator
        .publish_alert(&req.source, req.severity, &req.message)
        .await?)
}

async fn query_alerts(
    State(state): State<AppState>,
    query: Result<Query<AlertQuery>, QueryRejection>,
) -> ApiResult<Vec<Alert>> {
    let Query(query) = query?;
    let min = query.min_severity.unwrap_or(Severity::Info);
    ok(state.coordinator.query_alerts(query.since, min).await)
}

async fn list_workers(
    State(state): State<AppState>,
    query: Result<Query<WorkerQuery>, QueryRejection>,
) -> ApiResult<Vec<WorkerStatus>> {
    let Query(query) = query?;
    match &state.supervisor {
        Some(supervisor) => ok(supervisor.statuses(query.tier)),
        None => ok(Vec::new()),
    }
}

async fn worker_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkerStatus> {
    ok(state.supervisor()?.status(&id)?)
}

async fn start_worker(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkerStatus> {
    ok(state.supervisor()?.start(&id).await?)
}

async fn stop_worker(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkerStatus> {
    ok(state.supervisor()?.stop(&id).await?)
}

async fn restart_worker(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkerStatus> {
    ok(state.supervisor()?.restart(&id).await?)
}

async fn probe_worker(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkerStatus> {
    let supervisor = state.supervisor()?;
    match supervisor.probe(&id).await {
        Ok(status) => ok(status),
        Err(e) => {
            warn!(worker_id = %id, error = %e, "Operator probe failed");
            Err(e.into())
        }
    }
}
