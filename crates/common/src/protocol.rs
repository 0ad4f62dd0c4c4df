//! Request and response types exchanged between components.
//!
//! These types are serialised as JSON over the join service, KMS and key
//! release endpoints. Byte fields travel as standard base64 strings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// HTTP paths shared by servers and their clients.
pub mod routes {
    /// Join service: issue a join ticket.
    pub const ISSUE_JOIN_TICKET: &str = "/v1/join-ticket";
    /// Join service: ask for the state-disk key to be pushed to the caller.
    pub const REQUEST_STATE_DISK_KEY: &str = "/v1/state-disk-key/request";
    /// Bootstrapper key release endpoint: receive a pushed state-disk key.
    pub const PUSH_STATE_DISK_KEY: &str = "/v1/state-disk-key";
    /// KMS: fetch (or create) a data encryption key.
    pub const GET_DATA_KEY: &str = "/v1/data-key";
    /// Liveness on every service.
    pub const HEALTH: &str = "/health";
}

// ---------------------------------------------------------------------------
// Join ticket
// ---------------------------------------------------------------------------

/// Request body for `POST /v1/join-ticket`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueJoinTicketRequest {
    /// UUID of the requesting node's state disk. Doubles as the KMS key ID.
    pub disk_uuid: String,
    /// Kubernetes node name the kubelet certificate is issued for.
    pub node_name: String,
    /// Whether the node asks to join as a control-plane member.
    pub is_control_plane: bool,
}

/// Successful response body for `POST /v1/join-ticket`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueJoinTicketResponse {
    #[serde(with = "base64_bytes")]
    pub state_disk_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub owner_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub cluster_id: Vec<u8>,
    /// PEM-encoded kubelet private key.
    #[serde(with = "base64_bytes")]
    pub kubelet_key: Vec<u8>,
    /// PEM-encoded kubelet certificate signed by the cluster CA.
    #[serde(with = "base64_bytes")]
    pub kubelet_cert: Vec<u8>,
    /// `host:port` of the Kubernetes API server.
    pub api_server_endpoint: String,
    /// Bootstrap token, `abcdef.0123456789abcdef`.
    pub token: String,
    /// `sha256:<hex>` hash of the cluster CA public key.
    pub discovery_token_ca_cert_hash: String,
    /// Key decrypting the uploaded control-plane certificates. Control plane only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    /// Shared control-plane PKI files keyed by path relative to the PKI dir.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", with = "base64_map")]
    pub control_plane_files: BTreeMap<String, Vec<u8>>,
}

impl fmt::Debug for IssueJoinTicketResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssueJoinTicketResponse")
            .field("state_disk_key", &"[REDACTED]")
            .field("kubelet_key", &"[REDACTED]")
            .field("api_server_endpoint", &self.api_server_endpoint)
            .field("certificate_key", &self.certificate_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "control_plane_files",
                &self.control_plane_files.keys().collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// State-disk key release
// ---------------------------------------------------------------------------

/// Request body for `POST /v1/state-disk-key` on a restarting node.
#[derive(Clone, Serialize, Deserialize)]
pub struct PushStateDiskKeyRequest {
    #[serde(with = "base64_bytes")]
    pub state_disk_key: Vec<u8>,
}

impl fmt::Debug for PushStateDiskKeyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushStateDiskKeyRequest([REDACTED])")
    }
}

/// Request body for `POST /v1/state-disk-key/request` on the join service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStateDiskKeyRequest {
    pub disk_uuid: String,
}

// ---------------------------------------------------------------------------
// KMS
// ---------------------------------------------------------------------------

/// Request body for `POST /v1/data-key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataKeyRequest {
    /// Key ID within the KEK namespace, normally a disk UUID.
    pub data_key_id: String,
    /// Requested key length in bytes.
    pub length: usize,
}

/// Successful response body for `POST /v1/data-key`.
#[derive(Clone, Serialize, Deserialize)]
pub struct GetDataKeyResponse {
    #[serde(with = "base64_bytes")]
    pub data_key: Vec<u8>,
}

impl fmt::Debug for GetDataKeyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GetDataKeyResponse([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Name of the reporting service.
    pub service: String,
}

impl HealthResponse {
    pub fn ok(service: impl Into<String>) -> Self {
        Self {
            status: "ok".into(),
            service: service.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// `#[serde(with = "base64_bytes")]`: `Vec<u8>` as a standard base64 string.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "base64_map")]`: map values as standard base64 strings.
pub mod base64_map {
    use std::collections::BTreeMap;

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{ser::SerializeMap, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = s.serialize_map(Some(map.len()))?;
        for (name, bytes) in map {
            out.serialize_entry(name, &STANDARD.encode(bytes))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(d)?;
        encoded
            .into_iter()
            .map(|(name, value)| {
                STANDARD
                    .decode(value.as_bytes())
                    .map(|bytes| (name, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
