//! `kms` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline.
//! 3. Build the key custody backends from the configured URIs.
//! 4. Build the Axum router and serve until interrupted.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zeroize::Zeroizing;

use kms::config::Config;
use kms::server::{router, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    common::telemetry::init("kms", cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.listen_port,
        storage_uri = %cfg.storage_uri,
        kms_uri = %cfg.kms_uri,
        "kms starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key custody backends
    // -----------------------------------------------------------------------
    let master_secret = match &cfg.master_secret_path {
        Some(path) => Some(Zeroizing::new(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read master secret from {path}"))?,
        )),
        None => None,
    };
    let coordinator = kms::setup::setup(
        &cfg.storage_uri,
        &cfg.kms_uri,
        master_secret.as_deref().map(Vec::as_slice),
    )
    .await
    .context("failed to set up key custody backends")?;

    // -----------------------------------------------------------------------
    // 4. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(coordinator, cfg.kek_id.clone());
    let router = router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    common::serve::serve(listener, router, None, shutdown).await
}

async fn shutdown_on_signal(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
    token.cancel();
}
