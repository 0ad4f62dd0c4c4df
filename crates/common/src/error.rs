//! Common error types shared across crates.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::protocol::ErrorResponse;

/// Top-level service error type.
///
/// Variants map to HTTP status codes returned to callers:
/// - [`ServiceError::BadRequest`] → 400
/// - [`ServiceError::NotFound`] → 404
/// - [`ServiceError::PreconditionFailed`] → 412
/// - [`ServiceError::Unavailable`] → 503
/// - [`ServiceError::Internal`] → 500
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed: missing field, wrong key length, or invalid JSON.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is well-formed but the server is in a state that refuses it,
    /// e.g. a state-disk key has already been delivered.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A collaborator (KMS, cluster admin, metadata) is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::PreconditionFailed(_) => 412,
            ServiceError::Unavailable(_) => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code placed in [`ErrorResponse::code`].
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::PreconditionFailed(_) => "precondition_failed",
            ServiceError::Unavailable(_) => "service_unavailable",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Rebuild a [`ServiceError`] from a status code and error body received
    /// from a peer service.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => ServiceError::BadRequest(message),
            404 => ServiceError::NotFound(message),
            412 => ServiceError::PreconditionFailed(message),
            503 => ServiceError::Unavailable(message),
            _ => ServiceError::Internal(message),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse::new(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}
