//! Read-only HTTP view of the state document.
//!
//! | Route | Body |
//! |---|---|
//! | `GET /health` | `{"status": "ok"}` |
//! | `GET /api/state` | the full document, 404 before `foreman init` |
//! | `GET /api/stuck` | stuck and needs-human tasks, interventions, stats |
//! | `GET /api/tasks/{id}` | one task |
//!
//! Nothing here writes. Every request reads the document under the shared
//! lock, so a dashboard sees the same snapshot the CLI would.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::state::StateStore;
pub use api::{AppState, SharedState, StuckReport};

pub const DEFAULT_PORT: u16 = 3142;

pub fn build_router(store: StateStore) -> Router {
    api::api_router()
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(AppState { store }))
}

/// Serve until Ctrl-C.
pub async fn start_server(port: u16, store: StateStore) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, state = %store.path().display(), "snapshot server listening");
    println!("Serving pipeline state at http://{}/api/state", local_addr);

    axum::serve(listener, build_router(store))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("snapshot server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for Ctrl-C; serving until killed");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PipelineState, Spec, Stage, Task, TaskStatus, Worker};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    fn seeded() -> PipelineState {
        let now = Utc::now();
        let mut state = PipelineState::seeded(
            "shop",
            30,
            vec![Spec::new("auth", "Auth")],
            vec![
                Task::new("auth-001", "auth", "Users table", Stage::Database),
                Task::new("auth-002", "auth", "Login API", Stage::Backend),
                Task::new("auth-003", "auth", "Login page", Stage::Frontend),
            ],
            vec![Worker::new("fm-database", Stage::Database, now)],
            now,
        );
        let stuck = state.tasks.get_mut("auth-002").unwrap();
        stuck.status = TaskStatus::Stuck;
        stuck.stuck_reason = Some("compile error".into());
        let human = state.tasks.get_mut("auth-003").unwrap();
        human.status = TaskStatus::NeedsHuman;
        human.human_needed = Some("Pick an OAuth provider".into());
        state.refresh_derived(now);
        state
    }

    async fn test_router(initialize: bool) -> (Router, TempDir) {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        if initialize {
            store.initialize(seeded(), false).await.unwrap();
        }
        (build_router(store), dir)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _dir) = test_router(false).await;
        let (status, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_state_before_init_is_not_found() {
        let (app, _dir) = test_router(false).await;
        let (status, body) = get(app, "/api/state").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("foreman init"));
    }

    #[tokio::test]
    async fn test_state_returns_document() {
        let (app, _dir) = test_router(true).await;
        let (status, body) = get(app, "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["project"], "shop");
        assert_eq!(body["stats"]["totalTasks"], 3);
        assert_eq!(body["queues"]["database"][0], "auth-001");
    }

    #[tokio::test]
    async fn test_stuck_separates_needs_human() {
        let (app, _dir) = test_router(true).await;
        let (status, body) = get(app, "/api/stuck").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stuck"].as_array().unwrap().len(), 1);
        assert_eq!(body["stuck"][0]["stuckReason"], "compile error");
        assert_eq!(body["needsHuman"].as_array().unwrap().len(), 1);
        assert_eq!(body["needsHuman"][0]["id"], "auth-003");
        assert_eq!(body["stats"]["stuckTasks"], 1);
    }

    #[tokio::test]
    async fn test_single_task() {
        let (app, _dir) = test_router(true).await;
        let (status, body) = get(app.clone(), "/api/tasks/auth-001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Users table");

        let (status, _) = get(app, "/api/tasks/auth-999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
