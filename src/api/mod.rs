//! HTTP facade over the runtime.
//!
//! JSON over HTTP; the runtime stays the source of truth and the facade
//! is a thin adapter.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{ErrorKind, RuntimeError};
use crate::runtime::Runtime;
use crate::services::monitor::SYSTEM_OWNER;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err.kind() {
            ErrorKind::Input => match err {
                RuntimeError::GoalNotFound(_)
                | RuntimeError::TaskNotFound(_)
                | RuntimeError::AgentNotFound(_)
                | RuntimeError::PluginNotFound(_) => Self::not_found(err.to_string()),
                other => Self::bad_request(other.to_string()),
            },
            _ => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitGoalRequest {
    pub description: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub required_capabilities: Option<BTreeSet<String>>,
}

#[derive(Debug, Serialize)]
pub struct SubmitGoalResponse {
    pub goal_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub goal_id: Uuid,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the facade router over a runtime.
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/goals", post(submit_goal))
        .route("/goals/{id}", get(goal_status))
        .route("/goals/{id}/cancel", post(cancel_goal))
        .route("/agents", get(list_agents))
        .route("/uptime", get(uptime))
        .route("/system/stats", get(system_stats))
        .route("/health", get(health))
        .with_state(runtime)
}

/// Serve the facade until the process stops.
pub async fn serve(runtime: Arc<Runtime>, port: u16) -> anyhow::Result<()> {
    let app = router(runtime);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP facade listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit_goal(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<SubmitGoalRequest>,
) -> Result<Json<SubmitGoalResponse>, ApiError> {
    if request.description.trim().is_empty() {
        return Err(ApiError::bad_request("description cannot be empty"));
    }
    let goal_id = runtime
        .orchestrator
        .submit(
            request.description,
            request.priority.unwrap_or(0),
            request.deadline,
            request.required_capabilities.unwrap_or_default(),
        )
        .await?;
    let status = runtime
        .scheduler
        .get_goal(goal_id)
        .await
        .map(|g| g.status.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    Ok(Json(SubmitGoalResponse { goal_id, status }))
}

async fn goal_status(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = runtime.orchestrator.goal_view(id).await?;
    let progress = runtime.scheduler.goal_progress(id).await;
    Ok(Json(serde_json::json!({
        "goal_id": view.goal.id,
        "description": view.goal.description,
        "status": view.goal.status.as_str(),
        "priority": view.goal.priority,
        "error": view.goal.error,
        "error_counts": view.error_counts,
        "tasks": view.tasks,
        "progress": progress,
    })))
}

async fn cancel_goal(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    runtime.orchestrator.cancel(id).await?;
    Ok(Json(CancelResponse {
        goal_id: id,
        status: "cancelled".to_string(),
    }))
}

async fn list_agents(
    State(runtime): State<Arc<Runtime>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let fleet = runtime.manager.fleet().await;
    let agents: Vec<serde_json::Value> = fleet
        .iter()
        .map(|agent| {
            serde_json::json!({
                "agent_id": agent.id,
                "role": agent.role.as_str(),
                "goal_id": agent.goal_id,
                "status": agent.status.as_str(),
                "current_tasks": agent.current_tasks,
                "last_heartbeat": agent.last_heartbeat,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "agents": agents })))
}

async fn uptime(State(runtime): State<Arc<Runtime>>) -> Json<serde_json::Value> {
    let report = runtime.orchestrator.uptime().await;
    Json(serde_json::json!({
        "start_time": report.start_time,
        "uptime_seconds": report.uptime_seconds,
        "status": report.status,
        "metrics": report.metrics,
    }))
}

async fn system_stats(State(runtime): State<Arc<Runtime>>) -> Json<serde_json::Value> {
    let usage = runtime.monitor.get_usage(SYSTEM_OWNER).await;
    let pools = runtime.monitor.pool_snapshot();
    Json(serde_json::json!({
        "system": usage,
        "pools": pools,
    }))
}

async fn health(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    if runtime.orchestrator.is_initialized() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}
