//! Health check endpoints.

use axum::{Json, extract::State};
use gravel_common::NodeState;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    active_nodes: usize,
    joining_nodes: usize,
    connections: usize,
}

/// Readiness check, with a summary of the membership snapshot
pub async fn ready_check(State(state): State<AppState>) -> Json<ReadyResponse> {
    let view = state.manager.view();

    Json(ReadyResponse {
        status: "ready",
        active_nodes: view.count(NodeState::Active),
        joining_nodes: view.count(NodeState::Joining),
        connections: view.connections,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{app, call};
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_counts_active_nodes() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/ready", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_nodes"], 0);
        assert_eq!(body["connections"], 0);
    }
}
