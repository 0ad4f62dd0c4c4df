//! `bootstrapper` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise JSON logging.
//! 3. Build the state disk and metadata client.
//! 4. Restarting node: wait for the pushed disk key and open the disk.
//!    New node: run the join client until it finishes.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use bootstrapper::config::Config;
use bootstrapper::cryptmapper::{Blkid, CryptMapper, Cryptsetup};
use bootstrapper::joinclient::{HttpJoinTicketClient, JoinClientConfig, JoinClientDeps};
use bootstrapper::keyservice::HttpKeyRequester;
use bootstrapper::kubernetes::KubeadmJoiner;
use bootstrapper::metadata::{HttpMetadataClient, MetadataApi};
use bootstrapper::statedisk::{CryptStateDisk, StateDisk};
use bootstrapper::{JoinClient, KeyReleaseWaiter, NodeLock};

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
    // 2. Logging
    // -----------------------------------------------------------------------
    common::telemetry::init_json(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %cfg.state_disk_device,
        integrity = cfg.state_disk_integrity,
        "bootstrapper starting"
    );

    // -----------------------------------------------------------------------
    // 3. State disk and metadata
    // -----------------------------------------------------------------------
    let mapper = CryptMapper::new(Arc::new(Cryptsetup), Arc::new(Blkid));
    let disk = Arc::new(CryptStateDisk::new(
        mapper,
        &cfg.state_disk_device,
        &cfg.state_disk_mapping,
        cfg.state_disk_integrity,
    ));
    let metadata: Arc<dyn MetadataApi> = Arc::new(HttpMetadataClient::new(
        &cfg.metadata_endpoint,
        cfg.call_timeout(),
    )?);

    let root_ca = match &cfg.tls_ca_path {
        Some(path) => Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read root CA from {path}"))?,
        ),
        None => None,
    };

    // -----------------------------------------------------------------------
    // 4. Restart or join
    // -----------------------------------------------------------------------
    if disk.is_initialized().await? {
        info!("state disk is initialised, node is restarting");
        restart(&cfg, disk, metadata, root_ca.is_some()).await
    } else {
        info!("state disk is empty, joining the cluster");
        join(&cfg, disk, metadata, root_ca.as_deref()).await
    }
}

async fn restart(
    cfg: &Config,
    disk: Arc<CryptStateDisk>,
    metadata: Arc<dyn MetadataApi>,
    use_tls: bool,
) -> Result<()> {
    let requester = Arc::new(HttpKeyRequester::new(use_tls, cfg.call_timeout())?);
    let waiter = KeyReleaseWaiter::new(
        metadata,
        requester,
        cfg.join_interval(),
        cfg.join_service_port,
    );

    let tls = match common::tls::load_server_config(
        cfg.tls_cert_path.as_deref().map(Path::new),
        cfg.tls_key_path.as_deref().map(Path::new),
    )? {
        Some(tls) => tls,
        None => {
            info!("no TLS certificate configured, using a self-signed one");
            common::tls::self_signed_server_config(vec!["localhost".to_owned()])?
        }
    };
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.key_release_port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let disk_uuid = disk.uuid().await?;
    let key = waiter
        .wait_for_decryption_key(&disk_uuid, listener, Some(tls))
        .await
        .context("failed to receive state disk key")?;
    disk.open(&key).await?;
    info!(%disk_uuid, "state disk restored");
    Ok(())
}

async fn join(
    cfg: &Config,
    disk: Arc<CryptStateDisk>,
    metadata: Arc<dyn MetadataApi>,
    root_ca: Option<&[u8]>,
) -> Result<()> {
    let joiner = KubeadmJoiner::new(&cfg.kubeadm_config_dir);
    let client = JoinClient::new(
        JoinClientDeps {
            lock: Arc::new(NodeLock::new()),
            disk,
            metadata,
            rpc: Arc::new(HttpJoinTicketClient::new(root_ca, cfg.call_timeout())?),
            joiner: Arc::new(joiner.clone()),
        },
        JoinClientConfig {
            interval: cfg.join_interval(),
            call_timeout: cfg.call_timeout(),
            join_timeout: cfg.join_timeout(),
            join_service_port: cfg.join_service_port,
            pki_dir: joiner.pki_dir(),
        },
    );

    client.start().await;
    tokio::select! {
        result = client.wait() => result.context("node failed to join the cluster"),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping join client");
            client.stop().await;
            anyhow::bail!("interrupted before the node joined")
        }
    }
}
