//! Local cluster join through `kubeadm join`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::protocol::IssueJoinTicketResponse;
use common::{InstanceMetadata, Role};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";
const API_SERVER_PORT: u16 = 6443;
const JOIN_CONFIG_FILE: &str = "kubeadm-join.yaml";

/// Joins this node to the cluster with issued credentials.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterJoiner: Send + Sync {
    async fn join(&self, node: &InstanceMetadata, ticket: &IssueJoinTicketResponse) -> Result<()>;
}

/// [`ClusterJoiner`] shelling out to `kubeadm join --config`.
#[derive(Debug, Clone)]
pub struct KubeadmJoiner {
    config_dir: PathBuf,
}

impl KubeadmJoiner {
    /// `config_dir` receives the join configuration; `<config_dir>/pki`
    /// receives the kubelet credentials.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.config_dir.join("pki")
    }
}

#[async_trait]
impl ClusterJoiner for KubeadmJoiner {
    async fn join(&self, node: &InstanceMetadata, ticket: &IssueJoinTicketResponse) -> Result<()> {
        let pki = self.pki_dir();
        write_file(&pki.join("kubelet.crt"), &ticket.kubelet_cert, 0o644).await?;
        write_file(&pki.join("kubelet.key"), &ticket.kubelet_key, 0o600).await?;

        let yaml = JoinConfiguration::for_node(node, ticket)?.to_yaml()?;
        let config_path = self.config_dir.join(JOIN_CONFIG_FILE);
        write_file(&config_path, yaml.as_bytes(), 0o600).await?;

        debug!(config = %config_path.display(), "running kubeadm join");
        let output = Command::new("kubeadm")
            .arg("join")
            .arg("--config")
            .arg(&config_path)
            .output()
            .await
            .context("failed to spawn kubeadm")?;
        if !output.status.success() {
            anyhow::bail!(
                "kubeadm join failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(node = %node.node_name(), role = %node.role, "kubeadm join succeeded");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinConfiguration {
    api_version: &'static str,
    kind: &'static str,
    node_registration: NodeRegistration,
    discovery: Discovery,
    #[serde(skip_serializing_if = "Option::is_none")]
    control_plane: Option<JoinControlPlane>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRegistration {
    name: String,
    kubelet_extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Discovery {
    bootstrap_token: BootstrapTokenDiscovery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapTokenDiscovery {
    api_server_endpoint: String,
    token: String,
    ca_cert_hashes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinControlPlane {
    #[serde(rename = "localAPIEndpoint")]
    local_api_endpoint: ApiEndpoint,
    certificate_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiEndpoint {
    advertise_address: String,
    bind_port: u16,
}

impl JoinConfiguration {
    fn for_node(node: &InstanceMetadata, ticket: &IssueJoinTicketResponse) -> Result<Self> {
        let node_ip = node
            .private_ips
            .first()
            .context("node has no private IP")?
            .clone();

        let control_plane = match node.role {
            Role::ControlPlane => Some(JoinControlPlane {
                local_api_endpoint: ApiEndpoint {
                    advertise_address: node_ip.clone(),
                    bind_port: API_SERVER_PORT,
                },
                certificate_key: ticket
                    .certificate_key
                    .clone()
                    .context("control plane ticket has no certificate key")?,
            }),
            _ => None,
        };

        Ok(Self {
            api_version: KUBEADM_API_VERSION,
            kind: "JoinConfiguration",
            node_registration: NodeRegistration {
                name: node.node_name(),
                kubelet_extra_args: BTreeMap::from([("node-ip".to_owned(), node_ip)]),
            },
            discovery: Discovery {
                bootstrap_token: BootstrapTokenDiscovery {
                    api_server_endpoint: ticket.api_server_endpoint.clone(),
                    token: ticket.token.clone(),
                    ca_cert_hashes: vec![ticket.discovery_token_ca_cert_hash.clone()],
                },
            },
            control_plane,
        })
    }

    fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to render kubeadm join configuration")
    }
}

/// Write control-plane PKI files below `pki_dir`. Names are relative paths
/// such as `etcd/ca.crt`; anything escaping `pki_dir` is rejected.
pub async fn write_control_plane_files(
    pki_dir: &Path,
    files: &BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    for (name, contents) in files {
        let rel = Path::new(name);
        if rel.as_os_str().is_empty()
            || !rel.components().all(|c| matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("refusing to write control plane file {name:?}");
        }
        let mode = if name.ends_with(".key") { 0o600 } else { 0o644 };
        write_file(&pki_dir.join(rel), contents, mode).await?;
    }
    info!(count = files.len(), dir = %pki_dir.display(), "control plane files written");
    Ok(())
}

async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("failed to flush {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn node(role: Role) -> InstanceMetadata {
        InstanceMetadata {
            name: "Node_1".into(),
            role,
            private_ips: vec!["10.0.0.2".into()],
            ..Default::default()
        }
    }

    fn ticket(certificate_key: Option<&str>) -> IssueJoinTicketResponse {
        IssueJoinTicketResponse {
            state_disk_key: vec![0; 64],
            owner_id: b"owner".to_vec(),
            cluster_id: b"cluster".to_vec(),
            kubelet_key: b"KEY".to_vec(),
            kubelet_cert: b"CERT".to_vec(),
            api_server_endpoint: "10.0.0.1:6443".into(),
            token: "abcdef.0123456789abcdef".into(),
            discovery_token_ca_cert_hash: "sha256:1234".into(),
            certificate_key: certificate_key.map(str::to_owned),
            control_plane_files: BTreeMap::new(),
        }
    }

    #[test]
    fn worker_config_has_no_control_plane_section() {
        let yaml = JoinConfiguration::for_node(&node(Role::Worker), &ticket(None))
            .unwrap()
            .to_yaml()
            .unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["kind"], "JoinConfiguration");
        assert_eq!(doc["apiVersion"], KUBEADM_API_VERSION);
        assert_eq!(doc["nodeRegistration"]["name"], "node-1");
        assert_eq!(doc["nodeRegistration"]["kubeletExtraArgs"]["node-ip"], "10.0.0.2");
        assert_eq!(doc["discovery"]["bootstrapToken"]["apiServerEndpoint"], "10.0.0.1:6443");
        assert_eq!(doc["discovery"]["bootstrapToken"]["caCertHashes"][0], "sha256:1234");
        assert!(doc.get("controlPlane").is_none());
    }

    #[test]
    fn control_plane_config_carries_certificate_key() {
        let yaml = JoinConfiguration::for_node(&node(Role::ControlPlane), &ticket(Some("ab12")))
            .unwrap()
            .to_yaml()
            .unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["controlPlane"]["certificateKey"], "ab12");
        assert_eq!(doc["controlPlane"]["localAPIEndpoint"]["advertiseAddress"], "10.0.0.2");
        assert_eq!(doc["controlPlane"]["localAPIEndpoint"]["bindPort"], 6443);
    }

    #[test]
    fn control_plane_without_certificate_key_is_rejected() {
        assert!(JoinConfiguration::for_node(&node(Role::ControlPlane), &ticket(None)).is_err());
    }

    #[test]
    fn node_without_ip_is_rejected() {
        let mut n = node(Role::Worker);
        n.private_ips.clear();
        assert!(JoinConfiguration::for_node(&n, &ticket(None)).is_err());
    }

    #[tokio::test]
    async fn writes_nested_control_plane_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = BTreeMap::from([
            ("ca.crt".to_owned(), b"CA".to_vec()),
            ("etcd/ca.key".to_owned(), b"ETCD".to_vec()),
        ]);
        write_control_plane_files(dir.path(), &files).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("ca.crt")).unwrap(), b"CA");
        let key = dir.path().join("etcd/ca.key");
        assert_eq!(std::fs::read(&key).unwrap(), b"ETCD");
        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn rejects_paths_escaping_pki_dir() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../evil", "/etc/passwd", ""] {
            let files = BTreeMap::from([(name.to_owned(), b"x".to_vec())]);
            assert!(write_control_plane_files(dir.path(), &files).await.is_err());
        }
    }
}
