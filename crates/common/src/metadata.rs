//! Instance identity as reported by the metadata provider.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Role {
    ControlPlane,
    Worker,
    /// Anything the metadata provider reports that is not a known role.
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::ControlPlane => "ControlPlane",
            Role::Worker => "Worker",
            Role::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Identity of one instance, as returned by `GET /self` and `GET /peers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstanceMetadata {
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub private_ips: Vec<String>,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub provider_id: String,
}

impl InstanceMetadata {
    /// Kubernetes-compliant node name: lowercase, `_` replaced by `-`.
    pub fn node_name(&self) -> String {
        self.name.to_lowercase().replace('_', "-")
    }
}
