//! Cluster-admin collaborator: bootstrap tokens and shared control-plane
//! material, backed by the `kubeadm` CLI on the control-plane node.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Credentials a node needs to discover and authenticate to the API server.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken {
    /// `host:port` of the API server.
    pub api_server_endpoint: String,
    pub token: String,
    /// `sha256:<hex>` of the cluster CA public key.
    pub ca_cert_hash: String,
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken")
            .field("api_server_endpoint", &self.api_server_endpoint)
            .field("token", &"[REDACTED]")
            .field("ca_cert_hash", &self.ca_cert_hash)
            .finish()
    }
}

/// Control-plane PKI files shared with joining control-plane nodes, relative
/// to the PKI directory.
pub const CONTROL_PLANE_FILES: &[&str] = &[
    "ca.crt",
    "ca.key",
    "sa.key",
    "sa.pub",
    "front-proxy-ca.crt",
    "front-proxy-ca.key",
    "etcd/ca.crt",
    "etcd/ca.key",
];

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Create a bootstrap token valid for `ttl`.
    async fn get_join_token(&self, ttl: Duration) -> Result<JoinToken>;

    /// Re-upload the control-plane certificates and return the key that
    /// decrypts them.
    async fn get_control_plane_certificate_key(&self) -> Result<String>;

    /// Read the shared control-plane PKI files.
    async fn get_control_plane_certificates_and_keys(&self) -> Result<BTreeMap<String, Vec<u8>>>;
}

/// [`ClusterAdmin`] shelling out to `kubeadm`.
#[derive(Debug, Clone)]
pub struct Kubeadm {
    pki_dir: PathBuf,
}

impl Kubeadm {
    pub fn new(pki_dir: impl Into<PathBuf>) -> Self {
        Self {
            pki_dir: pki_dir.into(),
        }
    }
}

#[async_trait]
impl ClusterAdmin for Kubeadm {
    async fn get_join_token(&self, ttl: Duration) -> Result<JoinToken> {
        let ttl = format!("{}s", ttl.as_secs());
        let out = run("kubeadm", &["token", "create", "--print-join-command", "--ttl", &ttl]).await?;
        parse_join_command(&out)
    }

    async fn get_control_plane_certificate_key(&self) -> Result<String> {
        let out = run("kubeadm", &["init", "phase", "upload-certs", "--upload-certs"]).await?;
        parse_certificate_key(&out)
    }

    async fn get_control_plane_certificates_and_keys(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        for name in CONTROL_PLANE_FILES {
            let path = self.pki_dir.join(name);
            let contents = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            files.insert((*name).to_owned(), contents);
        }
        Ok(files)
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "running command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "{program} {} failed ({}): {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    String::from_utf8(output.stdout).with_context(|| format!("{program} printed non-UTF-8 output"))
}

/// Parse `kubeadm join <endpoint> --token <t> --discovery-token-ca-cert-hash <h>`.
pub fn parse_join_command(output: &str) -> Result<JoinToken> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("kubeadm join"))
        .context("no join command in kubeadm output")?;

    let mut words = line.split_whitespace().skip(2);
    let api_server_endpoint = words.next().context("join command has no API endpoint")?.to_owned();

    let mut token = None;
    let mut ca_cert_hash = None;
    while let Some(flag) = words.next() {
        match flag {
            "--token" => token = words.next().map(str::to_owned),
            "--discovery-token-ca-cert-hash" => ca_cert_hash = words.next().map(str::to_owned),
            _ => {}
        }
    }

    Ok(JoinToken {
        api_server_endpoint,
        token: token.context("join command has no --token")?,
        ca_cert_hash: ca_cert_hash.context("join command has no --discovery-token-ca-cert-hash")?,
    })
}

/// The certificate key is the last line printed by `upload-certs`: 64 hex chars.
pub fn parse_certificate_key(output: &str) -> Result<String> {
    let key = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .context("upload-certs printed nothing")?;
    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("upload-certs did not print a certificate key");
    }
    Ok(key.to_owned())
}
