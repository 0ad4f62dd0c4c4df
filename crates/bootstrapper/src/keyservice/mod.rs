//! Key Release Waiter: recovers the state-disk key on a restarting node.
//!
//! Two actors share one key slot. The receiver serves the push endpoint and
//! accepts exactly one well-formed key. The requester asks every control
//! plane to push the key, immediately and then on a fixed interval, until the
//! receiver signals.

pub mod requester;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{ServiceError, STATE_DISK_KEY_LENGTH};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::metadata::{control_plane_endpoints, MetadataApi};
pub use requester::{HttpKeyRequester, KeyRequester};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("node already received a state disk key")]
    AlreadyReceived,

    #[error("invalid state disk key: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

impl From<PushError> for ServiceError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::AlreadyReceived => ServiceError::PreconditionFailed(err.to_string()),
            PushError::InvalidLength { .. } => ServiceError::BadRequest(err.to_string()),
        }
    }
}

struct Inner {
    key: Mutex<Option<Zeroizing<Vec<u8>>>>,
    received_tx: mpsc::Sender<()>,
    received_rx: Mutex<mpsc::Receiver<()>>,
    metadata: Arc<dyn MetadataApi>,
    requester: Arc<dyn KeyRequester>,
    interval: Duration,
    join_service_port: u16,
}

/// Cheap to clone; clones share the key slot.
#[derive(Clone)]
pub struct KeyReleaseWaiter {
    inner: Arc<Inner>,
}

impl KeyReleaseWaiter {
    pub fn new(
        metadata: Arc<dyn MetadataApi>,
        requester: Arc<dyn KeyRequester>,
        interval: Duration,
        join_service_port: u16,
    ) -> Self {
        let (received_tx, received_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                key: Mutex::new(None),
                received_tx,
                received_rx: Mutex::new(received_rx),
                metadata,
                requester,
                interval,
                join_service_port,
            }),
        }
    }

    /// Accept `key` if no key has been received yet and it has the expected
    /// length.
    pub async fn push_state_disk_key(&self, key: &[u8]) -> Result<(), PushError> {
        let mut slot = self.inner.key.lock().await;
        if slot.is_some() {
            return Err(PushError::AlreadyReceived);
        }
        if key.len() != STATE_DISK_KEY_LENGTH {
            return Err(PushError::InvalidLength {
                expected: STATE_DISK_KEY_LENGTH,
                actual: key.len(),
            });
        }
        *slot = Some(Zeroizing::new(key.to_vec()));
        // A pending signal already wakes the waiter.
        let _ = self.inner.received_tx.try_send(());
        info!("state disk key received");
        Ok(())
    }

    /// Serve the push endpoint on `listener` and request the key for
    /// `disk_uuid` from all control planes until one arrives. The server is
    /// shut down gracefully before the key is returned.
    pub async fn wait_for_decryption_key(
        &self,
        disk_uuid: &str,
        listener: TcpListener,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if disk_uuid.is_empty() {
            anyhow::bail!("received no disk UUID");
        }

        let mut received = self
            .inner
            .received_rx
            .try_lock()
            .context("a wait for the decryption key is already in progress")?;

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(common::serve::serve(
            listener,
            server::router(self.clone()),
            tls,
            shutdown.clone(),
        ));
        info!(disk_uuid, "waiting for decryption key");

        let mut ticker = tokio::time::interval(self.inner.interval);
        loop {
            tokio::select! {
                biased;
                _ = received.recv() => break,
                _ = ticker.tick() => {}
            }
            // A round still in progress is abandoned once the key arrives.
            tokio::select! {
                biased;
                _ = received.recv() => break,
                _ = self.request_key(disk_uuid) => {}
            }
        }

        shutdown.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "key release server stopped with an error"),
            Err(e) => warn!(error = %e, "key release server task failed"),
        }

        self.inner
            .key
            .lock()
            .await
            .clone()
            .context("received signal without a stored key")
    }

    /// Clear the stored key for a fresh wait cycle. Must not be called while
    /// a wait is in progress.
    pub async fn reset_key(&self) {
        *self.inner.key.lock().await = None;
        match self.inner.received_rx.try_lock() {
            Ok(mut rx) => while rx.try_recv().is_ok() {},
            Err(_) => warn!("reset_key called during a wait"),
        }
    }

    async fn request_key(&self, disk_uuid: &str) {
        let instances = match self.inner.metadata.list().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "failed to list control planes");
                return;
            }
        };
        let endpoints = control_plane_endpoints(&instances, self.inner.join_service_port);
        debug!(?endpoints, "requesting state disk key");

        for endpoint in endpoints {
            if let Err(e) = self.inner.requester.request_key(&endpoint, disk_uuid).await {
                debug!(%endpoint, error = %e, "key request failed");
            }
        }
    }
}
