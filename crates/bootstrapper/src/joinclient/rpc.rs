//! Client side of the join ticket RPC.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::protocol::{routes, ErrorResponse, IssueJoinTicketRequest, IssueJoinTicketResponse};
use common::ServiceError;
use reqwest::{Certificate, Client};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoinTicketClient: Send + Sync {
    /// Request a join ticket from the join service at `endpoint` (`host:port`).
    async fn issue_join_ticket(
        &self,
        endpoint: &str,
        req: &IssueJoinTicketRequest,
    ) -> Result<IssueJoinTicketResponse>;
}

/// HTTP(S) [`JoinTicketClient`]. With a root CA the join service must present
/// a certificate chaining to it.
#[derive(Clone)]
pub struct HttpJoinTicketClient {
    client: Client,
    scheme: &'static str,
}

impl HttpJoinTicketClient {
    pub fn new(root_ca_pem: Option<&[u8]>, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        let scheme = match root_ca_pem {
            Some(pem) => {
                let ca = Certificate::from_pem(pem).context("invalid root CA certificate")?;
                builder = builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(ca);
                "https"
            }
            None => "http",
        };
        let client = builder.build().context("failed to build join ticket client")?;
        Ok(Self { client, scheme })
    }
}

#[async_trait]
impl JoinTicketClient for HttpJoinTicketClient {
    async fn issue_join_ticket(
        &self,
        endpoint: &str,
        req: &IssueJoinTicketRequest,
    ) -> Result<IssueJoinTicketResponse> {
        let url = format!("{}://{endpoint}{}", self.scheme, routes::ISSUE_JOIN_TICKET);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .with_context(|| format!("join ticket request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let message = match resp.json::<ErrorResponse>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            return Err(ServiceError::from_status(status.as_u16(), message))
                .with_context(|| format!("join service at {endpoint} refused the ticket"));
        }
        resp.json()
            .await
            .with_context(|| format!("malformed join ticket from {endpoint}"))
    }
}
