//! Client for the metadata provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{InstanceMetadata, Role};
use reqwest::Client;

#[cfg(test)]
use mockall::automock;

/// Instance metadata as seen from this node.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Identity of the calling instance.
    async fn self_instance(&self) -> Result<InstanceMetadata>;

    /// All instances of the cluster, this one included.
    async fn list(&self) -> Result<Vec<InstanceMetadata>>;
}

/// HTTP JSON client for `GET /self` and `GET /peers`.
#[derive(Clone)]
pub struct HttpMetadataClient {
    base: String,
    client: Client,
}

impl HttpMetadataClient {
    /// `endpoint` is `host:port` or a full `http(s)://` base URL.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_owned()
        } else {
            format!("http://{endpoint}")
        };
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build metadata HTTP client")?;
        Ok(Self { base, client })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("metadata request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("metadata request to {url} was rejected"))?
            .json()
            .await
            .with_context(|| format!("metadata response from {url} is malformed"))
    }
}

#[async_trait]
impl MetadataApi for HttpMetadataClient {
    async fn self_instance(&self) -> Result<InstanceMetadata> {
        self.get("/self").await
    }

    async fn list(&self) -> Result<Vec<InstanceMetadata>> {
        self.get("/peers").await
    }
}

/// `ip:port` for every private IP of every control-plane instance.
pub fn control_plane_endpoints(instances: &[InstanceMetadata], port: u16) -> Vec<String> {
    instances
        .iter()
        .filter(|i| i.role == Role::ControlPlane)
        .flat_map(|i| i.private_ips.iter())
        .filter(|ip| !ip.is_empty())
        .map(|ip| join_host_port(ip, port))
        .collect()
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
