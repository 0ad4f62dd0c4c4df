//! Cluster identity record: the owner and cluster IDs written when the
//! cluster was initialised.
//!
//! Stored as JSON at `<base>/id`:
//!
//! ```json
//! {"owner_id": "<base64>", "cluster_id": "<base64>"}
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// File name of the identity record under the service base path.
pub const ID_FILE: &str = "id";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read cluster identity record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cluster identity record {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Owner and cluster IDs of the running cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterIdentity {
    #[serde(with = "common::protocol::base64_bytes")]
    pub owner_id: Vec<u8>,
    #[serde(with = "common::protocol::base64_bytes")]
    pub cluster_id: Vec<u8>,
}

impl ClusterIdentity {
    /// Read and validate `<base_path>/id`.
    ///
    /// Both IDs must be present and non-empty.
    pub async fn load(base_path: &Path) -> Result<Self, IdentityError> {
        let path = base_path.join(ID_FILE);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|source| IdentityError::Read {
                path: path.clone(),
                source,
            })?;

        let identity: ClusterIdentity =
            serde_json::from_slice(&raw).map_err(|e| IdentityError::Malformed {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if identity.owner_id.is_empty() || identity.cluster_id.is_empty() {
            return Err(IdentityError::Malformed {
                path,
                reason: "owner_id and cluster_id must not be empty".into(),
            });
        }
        Ok(identity)
    }
}
