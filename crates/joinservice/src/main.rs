//! `joinservice` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline.
//! 3. Build the KMS client, `kubeadm` wrapper, CA and key pusher.
//! 4. Build the Axum router and serve until interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use joinservice::ca::KubernetesCa;
use joinservice::config::Config;
use joinservice::keypush::HttpKeyPusher;
use joinservice::kms_client::KmsClient;
use joinservice::kubeadm::Kubeadm;
use joinservice::server::{router, state::AppState};
use joinservice::JoinTicketIssuer;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    common::telemetry::init(
        "joinservice",
        cfg.otel_exporter_otlp_endpoint.as_deref(),
        &cfg.log_level,
    )?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.listen_port,
        kms = %cfg.kms_endpoint,
        "joinservice starting"
    );

    // -----------------------------------------------------------------------
    // 3. Collaborators
    // -----------------------------------------------------------------------
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    let kms = Arc::new(KmsClient::new(&cfg.kms_endpoint, timeout)?);

    let root_ca = match &cfg.tls_ca_path {
        Some(path) => Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read root CA from {path}"))?,
        ),
        None => None,
    };
    let key_pusher = Arc::new(HttpKeyPusher::new(
        cfg.key_release_port,
        root_ca.as_deref(),
        timeout,
    )?);

    let issuer = JoinTicketIssuer::new(
        kms.clone(),
        Arc::new(Kubeadm::new(&cfg.kubernetes_pki_dir)),
        Arc::new(KubernetesCa::new(&cfg.kubernetes_pki_dir)),
        &cfg.service_base_path,
        Duration::from_secs(cfg.join_token_ttl_secs),
    );

    // -----------------------------------------------------------------------
    // 4. HTTP server
    // -----------------------------------------------------------------------
    let tls = common::tls::load_server_config(
        cfg.tls_cert_path.as_deref().map(Path::new),
        cfg.tls_key_path.as_deref().map(Path::new),
    )?;

    let state = AppState::new(issuer, kms, key_pusher);
    let router = router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    common::serve::serve(listener, router, tls, shutdown).await
}

async fn shutdown_on_signal(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
    token.cancel();
}
