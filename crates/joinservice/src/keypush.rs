//! Pushes a state-disk key to a restarting node's key release endpoint.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::protocol::{routes, PushStateDiskKeyRequest};
use reqwest::{Certificate, Client};
use tracing::info;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyPusher: Send + Sync {
    /// Deliver `key` to the node at `node_ip`.
    async fn push_state_disk_key(&self, node_ip: IpAddr, key: &[u8]) -> Result<()>;
}

/// HTTPS [`KeyPusher`].
///
/// With a root CA the node's endpoint must present a certificate chaining to
/// that CA; without one the node's self-signed certificate is accepted.
#[derive(Clone)]
pub struct HttpKeyPusher {
    client: Client,
    port: u16,
}

impl HttpKeyPusher {
    pub fn new(port: u16, root_ca_pem: Option<&[u8]>, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout).https_only(true);
        builder = match root_ca_pem {
            Some(pem) => {
                let ca = Certificate::from_pem(pem).context("invalid root CA certificate")?;
                builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(ca)
            }
            None => builder.danger_accept_invalid_certs(true),
        };
        let client = builder.build().context("failed to build key push client")?;
        Ok(Self { client, port })
    }

    fn url(&self, node_ip: IpAddr) -> String {
        let host = match node_ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        format!("https://{host}:{}{}", self.port, routes::PUSH_STATE_DISK_KEY)
    }
}

#[async_trait]
impl KeyPusher for HttpKeyPusher {
    async fn push_state_disk_key(&self, node_ip: IpAddr, key: &[u8]) -> Result<()> {
        let url = self.url(node_ip);
        let resp = self
            .client
            .post(&url)
            .json(&PushStateDiskKeyRequest {
                state_disk_key: key.to_vec(),
            })
            .send()
            .await
            .with_context(|| format!("failed to push key to {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let t = resp.text().await.unwrap_or_default();
            anyhow::bail!("key push to {url} failed {status} {t}");
        }
        info!(%node_ip, "state disk key pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn url_targets_key_release_endpoint_over_https() {
        let p = HttpKeyPusher::new(9000, None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            p.url("10.0.0.7".parse().unwrap()),
            "https://10.0.0.7:9000/v1/state-disk-key"
        );
        assert_eq!(
            p.url("fd00::7".parse().unwrap()),
            "https://[fd00::7]:9000/v1/state-disk-key"
        );
    }

    /// Key release endpoint with a self-signed certificate that records pushed keys.
    async fn release_endpoint() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            routes::PUSH_STATE_DISK_KEY,
            post(move |Json(req): Json<PushStateDiskKeyRequest>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(req.state_disk_key);
                    StatusCode::NO_CONTENT
                }
            }),
        );
        // Feature unification enables both rustls providers; pin `ring`.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let tls = common::tls::self_signed_server_config(vec!["localhost".into()]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        tokio::spawn(common::serve::serve(listener, app, Some(tls), shutdown.clone()));
        (port, rx, shutdown)
    }

    #[tokio::test]
    async fn pushes_over_tls_to_a_self_signed_node() {
        let (port, mut rx, shutdown) = release_endpoint().await;
        let pusher = HttpKeyPusher::new(port, None, Duration::from_secs(5)).unwrap();

        pusher
            .push_state_disk_key("127.0.0.1".parse().unwrap(), &[7; 64])
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![7; 64]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn untrusted_certificate_is_refused_when_a_ca_is_configured() {
        let (port, mut rx, shutdown) = release_endpoint().await;
        let other_key = rcgen::KeyPair::generate().unwrap();
        let other_ca = rcgen::CertificateParams::new(vec!["ca".to_owned()])
            .unwrap()
            .self_signed(&other_key)
            .unwrap();
        let pusher =
            HttpKeyPusher::new(port, Some(other_ca.pem().as_bytes()), Duration::from_secs(5))
                .unwrap();

        assert!(pusher
            .push_state_disk_key("127.0.0.1".parse().unwrap(), &[7; 64])
            .await
            .is_err());
        assert!(rx.try_recv().is_err());
        shutdown.cancel();
    }
}
