//! Client for the KMS data-key API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::protocol::{routes, ErrorResponse, GetDataKeyRequest, GetDataKeyResponse};
use common::ServiceError;
use reqwest::Client;
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

/// Fetches DEKs by key ID.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataKeyGetter: Send + Sync {
    /// Get (or create on first use) the `length`-byte key named `data_key_id`.
    async fn get_data_key(&self, data_key_id: &str, length: usize) -> Result<Zeroizing<Vec<u8>>>;
}

/// HTTP client for `POST /v1/data-key`.
#[derive(Clone)]
pub struct KmsClient {
    base: String,
    client: Client,
}

impl KmsClient {
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
            .context("failed to build KMS HTTP client")?;
        Ok(Self { base, client })
    }
}

#[async_trait]
impl DataKeyGetter for KmsClient {
    async fn get_data_key(&self, data_key_id: &str, length: usize) -> Result<Zeroizing<Vec<u8>>> {
        let url = format!("{}{}", self.base, routes::GET_DATA_KEY);
        let resp = self
            .client
            .post(&url)
            .json(&GetDataKeyRequest {
                data_key_id: data_key_id.to_owned(),
                length,
            })
            .send()
            .await
            .with_context(|| format!("KMS request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ErrorResponse>()
                .await
                .map(|e| e.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(ServiceError::from_status(status.as_u16(), message).into());
        }

        let body: GetDataKeyResponse = resp.json().await.context("invalid KMS response body")?;
        Ok(Zeroizing::new(body.data_key))
    }
}
