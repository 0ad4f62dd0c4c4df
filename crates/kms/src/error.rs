//! Coordinator-level errors and their HTTP mapping.

use common::ServiceError;
use thiserror::Error;

use crate::backend::{KekError, StorageError};

/// Errors returned by [`crate::KmsCoordinator::get_dek`].
#[derive(Debug, Error)]
pub enum KmsError {
    /// The requested DEK length is zero or above [`crate::MAX_DEK_LEN`].
    #[error("invalid DEK length {0}")]
    InvalidLength(usize),

    /// The key ID is empty.
    #[error("key ID must not be empty")]
    EmptyKeyId,

    /// A DEK is already stored for this key ID with a different length.
    #[error("stored DEK for {key_id} is {stored} bytes, requested {requested}")]
    LengthMismatch {
        key_id: String,
        stored: usize,
        requested: usize,
    },

    #[error(transparent)]
    Kek(#[from] KekError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<KmsError> for ServiceError {
    fn from(err: KmsError) -> Self {
        match err {
            KmsError::InvalidLength(_) | KmsError::EmptyKeyId => {
                ServiceError::BadRequest(err.to_string())
            }
            KmsError::LengthMismatch { .. } => ServiceError::PreconditionFailed(err.to_string()),
            KmsError::Kek(KekError::NotFound(_)) => ServiceError::NotFound(err.to_string()),
            KmsError::Kek(KekError::Provider(_)) | KmsError::Storage(StorageError::Backend(_)) => {
                ServiceError::Unavailable(err.to_string())
            }
            KmsError::Kek(KekError::Codec(_)) | KmsError::Storage(_) => {
                ServiceError::Internal(err.to_string())
            }
        }
    }
}
