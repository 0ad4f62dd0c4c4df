//! Axum request handlers for all service endpoints.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use common::protocol::{
    ErrorResponse, HealthResponse, IssueJoinTicketRequest, IssueJoinTicketResponse,
    RequestStateDiskKeyRequest,
};
use common::{ServiceError, STATE_DISK_KEY_LENGTH};
use tracing::{info, warn};

use super::state::AppState;

/// `POST /v1/join-ticket`: issue join credentials for a node.
pub async fn issue_join_ticket(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<IssueJoinTicketRequest>,
) -> Result<Json<IssueJoinTicketResponse>, ServiceError> {
    info!(%peer, disk_uuid = %req.disk_uuid, control_plane = req.is_control_plane, "join ticket requested");
    let ticket = state.issuer.issue_join_ticket(&req).await.map_err(|e| {
        warn!(%peer, error = %e, "join ticket refused");
        ServiceError::from(e)
    })?;
    Ok(Json(ticket))
}

/// `POST /v1/state-disk-key/request`: push the state-disk key for
/// `disk_uuid` to the calling node's key release endpoint.
///
/// The target is always the connection's peer address.
pub async fn request_state_disk_key(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<RequestStateDiskKeyRequest>,
) -> Result<StatusCode, ServiceError> {
    if req.disk_uuid.is_empty() {
        return Err(ServiceError::BadRequest("disk_uuid must not be empty".into()));
    }

    let key = state
        .kms
        .get_data_key(&req.disk_uuid, STATE_DISK_KEY_LENGTH)
        .await
        .map_err(|e| ServiceError::Unavailable(format!("failed to get state disk key: {e:#}")))?;

    state
        .key_pusher
        .push_state_disk_key(peer.ip(), &key)
        .await
        .map_err(|e| {
            warn!(%peer, error = %e, "state disk key push failed");
            ServiceError::Unavailable(format!("{e:#}"))
        })?;

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /health`: liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok("joinservice"))
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}
