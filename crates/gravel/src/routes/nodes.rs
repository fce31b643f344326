//! Join handshake and membership administration endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use gravel_common::{JoinError, NodeId, NodeInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::registry::UnregisterOutcome;
use crate::state::AppState;
use crate::tokens::fingerprint;

#[derive(Deserialize)]
pub struct JoinRequest {
    /// Address the node serves on (host:port)
    address: String,
    token: String,
}

#[derive(Serialize)]
pub struct JoinResponse {
    node_id: NodeId,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    code: &'static str,
}

/// Reserve membership for a node
///
/// Returns:
/// - 200: Node reserved, open the channel at `/nodes/ws` within the grace period
/// - 403: Refused, `code` tells why
pub async fn join(
    State(state): State<AppState>,
    Json(payload): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, (StatusCode, Json<ErrorResponse>)> {
    let node_id = state
        .manager
        .join(&payload.address, &payload.token)
        .await
        .map_err(join_error)?;

    Ok(Json(JoinResponse { node_id }))
}

fn join_error(e: JoinError) -> (StatusCode, Json<ErrorResponse>) {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::FORBIDDEN);
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code(),
        }),
    )
}

#[derive(Serialize)]
pub struct CurrentTokenResponse {
    /// Empty when no usable token exists
    token: String,
}

pub async fn current_token(State(state): State<AppState>) -> Json<CurrentTokenResponse> {
    Json(CurrentTokenResponse {
        token: state.manager.current_token().unwrap_or_default(),
    })
}

#[derive(Deserialize, Default)]
pub struct IssueTokenRequest {
    scope: Option<String>,
    ttl_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct IssueTokenResponse {
    token: String,
    scope: String,
    expires_at: DateTime<Utc>,
}

/// Issue a new join token; the body is optional
pub async fn issue_token(
    State(state): State<AppState>,
    payload: Option<Json<IssueTokenRequest>>,
) -> Json<IssueTokenResponse> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();

    let token = state
        .manager
        .issue_token(
            request.scope.as_deref(),
            request.ttl_secs.map(Duration::from_secs),
        )
        .await;

    Json(IssueTokenResponse {
        token: token.value,
        scope: token.scope,
        expires_at: token.expires_at,
    })
}

pub async fn revoke_token(State(state): State<AppState>, Path(token): Path<String>) -> StatusCode {
    if state.manager.revoke_token(&token).await {
        StatusCode::NO_CONTENT
    } else {
        tracing::debug!(fingerprint = %fingerprint(&token), "Revoke of unknown token");
        StatusCode::NOT_FOUND
    }
}

pub async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeInfo>> {
    Json(state.manager.nodes())
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeInfo>, StatusCode> {
    state
        .manager
        .node(&NodeId::from(node_id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Explicitly remove a node, closing its channel if open
pub async fn remove_node(State(state): State<AppState>, Path(node_id): Path<String>) -> StatusCode {
    let node_id = NodeId::from(node_id);

    match state.manager.remove(&node_id).await {
        Some(UnregisterOutcome::Released { state }) => {
            tracing::info!(node = %node_id, state = %state, "Node removed by operator");
            StatusCode::NO_CONTENT
        }
        Some(UnregisterOutcome::AlreadyRemoved) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

#[derive(Serialize)]
pub struct PurgeResponse {
    purged: usize,
}

pub async fn purge_retired(State(state): State<AppState>) -> Json<PurgeResponse> {
    Json(PurgeResponse {
        purged: state.manager.purge_retired().await,
    })
}
