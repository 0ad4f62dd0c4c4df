//! Best-effort "please push me a key" notifications to control planes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::protocol::{routes, RequestStateDiskKeyRequest};
use reqwest::Client;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyRequester: Send + Sync {
    /// Ask the join service at `endpoint` (`host:port`) to push the key for
    /// `disk_uuid` back to this node.
    async fn request_key(&self, endpoint: &str, disk_uuid: &str) -> Result<()>;
}

/// HTTP(S) [`KeyRequester`].
///
/// Server certificates are not verified: a key pushed by an impostor fails
/// to open the disk.
#[derive(Clone)]
pub struct HttpKeyRequester {
    scheme: &'static str,
    client: Client,
}

impl HttpKeyRequester {
    pub fn new(use_tls: bool, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build key request HTTP client")?;
        Ok(Self {
            scheme: if use_tls { "https" } else { "http" },
            client,
        })
    }
}

#[async_trait]
impl KeyRequester for HttpKeyRequester {
    async fn request_key(&self, endpoint: &str, disk_uuid: &str) -> Result<()> {
        let url = format!("{}://{endpoint}{}", self.scheme, routes::REQUEST_STATE_DISK_KEY);
        self.client
            .post(&url)
            .json(&RequestStateDiskKeyRequest {
                disk_uuid: disk_uuid.to_owned(),
            })
            .send()
            .await
            .with_context(|| format!("key request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("key request to {url} was rejected"))?;
        Ok(())
    }
}
