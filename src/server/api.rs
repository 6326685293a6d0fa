use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use crate::errors::StoreError;
use crate::state::{Intervention, PipelineState, StateStore, Stats, Task, TaskStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: StateStore,
}

pub type SharedState = Arc<AppState>;

// ── Response payload types ────────────────────────────────────────────

/// Tasks the pipeline gave up on, kept apart from tasks that wait on a person.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckReport {
    pub stuck: Vec<Task>,
    pub needs_human: Vec<Task>,
    pub interventions: Vec<Intervention>,
    pub stats: Stats,
}

impl StuckReport {
    pub fn from_state(state: &PipelineState) -> Self {
        Self {
            stuck: state.tasks_with_status(TaskStatus::Stuck).cloned().collect(),
            needs_human: state
                .tasks_with_status(TaskStatus::NeedsHuman)
                .cloned()
                .collect(),
            interventions: state.interventions.clone(),
            stats: state.stats,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotInitialized { .. } => ApiError::NotFound(err.to_string()),
            StoreError::LockTimeout { .. } => ApiError::Unavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/state", get(get_state))
        .route("/api/stuck", get(get_stuck))
        .route("/api/tasks/{id}", get(get_task))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_state(State(app): State<SharedState>) -> Result<Json<PipelineState>, ApiError> {
    Ok(Json(app.store.load().await?))
}

async fn get_stuck(State(app): State<SharedState>) -> Result<Json<StuckReport>, ApiError> {
    let state = app.store.load().await?;
    Ok(Json(StuckReport::from_state(&state)))
}

async fn get_task(
    State(app): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let state = app.store.load().await?;
    state
        .tasks
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown task: {}", id)))
}
