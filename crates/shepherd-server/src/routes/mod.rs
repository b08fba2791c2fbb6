pub mod dto;
pub mod internal;
pub mod public;
pub mod ws;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;

use crate::state::ServerState;

/// `:8080` -- create/list/get tasks, the event-stream websocket, and the two
/// health endpoints (§4.3, §6.1).
pub fn public_router(state: ServerState) -> Router {
    Router::new()
        .route("/api/v1/tasks", axum::routing::post(public::create_task).get(public::list_tasks))
        .route("/api/v1/tasks/{id}", get(public::get_task))
        .route("/api/v1/tasks/{id}/events", get(ws::event_stream))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// `:8081` -- agent-only traffic: status, event ingest, task data, token
/// issuance (§4.3, §6.2). Not browser-facing; no CORS layer needed.
pub fn internal_router(state: ServerState) -> Router {
    Router::new()
        .route("/api/v1/tasks/{id}/status", axum::routing::post(internal::post_status))
        .route("/api/v1/tasks/{id}/events", axum::routing::post(internal::post_events))
        .route("/api/v1/tasks/{id}/data", get(internal::get_data))
        .route("/api/v1/tasks/{id}/token", get(internal::get_token))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(axum::extract::State(state): axum::extract::State<ServerState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ready": false })))
    }
}
