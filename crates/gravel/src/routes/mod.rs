//! HTTP route handlers for the node manager.

use axum::{
    Router,
    http::StatusCode,
    routing::{delete, get, post},
};
use gravel_common::constants::routes;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::state::AppState;

mod health;
mod nodes;
mod ws;

/// Upper bound for plain HTTP requests; WebSocket routes are exempt
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Join handshake
        .route(routes::JOIN, post(nodes::join))
        .route(routes::TOKEN, get(nodes::current_token).post(nodes::issue_token))
        .route("/nodes/token/{token}", delete(nodes::revoke_token))

        // Membership administration
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/purge", post(nodes::purge_retired))
        .route("/nodes/{node_id}", get(nodes::get_node).delete(nodes::remove_node))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, REQUEST_TIMEOUT));

    Router::new()
        .route(routes::CHANNEL, get(ws::node_channel))
        .merge(api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        // Add shared state
        .with_state(state)
}
