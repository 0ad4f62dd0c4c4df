//! Axum request handlers for all service endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::protocol::{ErrorResponse, GetDataKeyRequest, GetDataKeyResponse, HealthResponse};
use common::ServiceError;
use tracing::{info, warn};

use super::state::AppState;

/// `POST /v1/data-key`: get or create the DEK named `data_key_id`.
pub async fn get_data_key(
    State(state): State<AppState>,
    Json(req): Json<GetDataKeyRequest>,
) -> Result<Json<GetDataKeyResponse>, ServiceError> {
    let dek = state
        .coordinator
        .get_dek(&state.kek_id, &req.data_key_id, req.length)
        .await
        .map_err(|e| {
            warn!(data_key_id = %req.data_key_id, error = %e, "data key request failed");
            ServiceError::from(e)
        })?;

    info!(data_key_id = %req.data_key_id, length = req.length, "data key served");
    Ok(Json(GetDataKeyResponse {
        data_key: dek.to_vec(),
    }))
}

/// `GET /health`: liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok("kms"))
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}
