use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{debug, warn};

use super::broadcaster::EventBroadcaster;
use crate::errors::StateError;
use crate::monitor::{HealthChecker, SnapshotHandle};
use crate::orchestrator::PhaseUpdate;
use crate::state::{WorkflowStateStore, validate_adw_id};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: WorkflowStateStore,
    pub snapshots: SnapshotHandle,
    pub health: Arc<HealthChecker>,
    pub broadcaster: Arc<EventBroadcaster>,
}

pub type SharedState = Arc<AppState>;

// ── Error type ────────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            StateError::InvalidId(_) | StateError::InvalidTransition { .. } => {
                ApiError::BadRequest(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{adw_id}/health", get(workflow_health))
        .route("/api/workflow-updates", post(receive_update))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_workflows(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .snapshots
        .snapshot()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(snapshot))
}

async fn workflow_health(
    State(state): State<SharedState>,
    Path(adw_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_adw_id(&adw_id)?;
    if !state.store.workflow_dir(&adw_id).is_dir() {
        return Err(ApiError::NotFound(format!("Workflow {adw_id} not found")));
    }
    Ok(Json(state.health.check(&adw_id).await))
}

async fn receive_update(
    State(state): State<SharedState>,
    Json(update): Json<PhaseUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    debug!(
        adw_id = %update.adw_id,
        phase = %update.current_phase,
        status = %update.status,
        event = ?update.event,
        "phase update received"
    );
    state.broadcaster.notify(&update).await.map_err(|e| {
        warn!(adw_id = %update.adw_id, error = %e, "rejected phase update");
        ApiError::from(e)
    })?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── Tests ─────────────────────────────────────────────────────────────
