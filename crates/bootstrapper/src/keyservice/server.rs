//! HTTP surface of the Key Release Waiter.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common::protocol::{routes, ErrorResponse, HealthResponse, PushStateDiskKeyRequest};
use common::ServiceError;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use super::KeyReleaseWaiter;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub fn router(waiter: KeyReleaseWaiter) -> Router {
    Router::new()
        .route(routes::PUSH_STATE_DISK_KEY, post(push_state_disk_key))
        .route(routes::HEALTH, get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(waiter)
}

/// `POST /v1/state-disk-key`
async fn push_state_disk_key(
    State(waiter): State<KeyReleaseWaiter>,
    Json(req): Json<PushStateDiskKeyRequest>,
) -> Result<StatusCode, ServiceError> {
    waiter
        .push_state_disk_key(&req.state_disk_key)
        .await
        .map_err(|e| {
            warn!(error = %e, "state disk key push rejected");
            ServiceError::from(e)
        })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok("bootstrapper"))
}

async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}
