//! Join Client: discovers a control plane, obtains a join ticket and joins
//! this node to the cluster.
//!
//! Every tick re-reads this node's identity and the peer list, then asks each
//! control-plane endpoint in turn for a ticket. The first ticket wins. The
//! [`NodeLock`] is taken only after a ticket was obtained; from then on any
//! failure ends the loop.

pub mod rpc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::protocol::{IssueJoinTicketRequest, IssueJoinTicketResponse};
use common::{InstanceMetadata, Role};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kubernetes::{write_control_plane_files, ClusterJoiner};
use crate::metadata::{control_plane_endpoints, MetadataApi};
use crate::nodelock::NodeLock;
use crate::statedisk::StateDisk;
pub use rpc::{HttpJoinTicketClient, JoinTicketClient};

/// Terminal outcome of a join loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("node did not join the cluster within {0:?}")]
    Timeout(Duration),

    #[error("join was stopped before it completed")]
    Stopped,

    #[error("join client was never started")]
    NotStarted,

    #[error("failed to open state disk: {0}")]
    StateDisk(String),

    #[error("failed to write control plane files: {0}")]
    ControlPlaneFiles(String),

    #[error("failed to join cluster: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct JoinClientConfig {
    /// Pause between attempts.
    pub interval: Duration,
    /// Bound on each metadata or ticket call.
    pub call_timeout: Duration,
    /// Bound on the whole loop.
    pub join_timeout: Duration,
    pub join_service_port: u16,
    /// Control-plane files from the ticket are written here.
    pub pki_dir: PathBuf,
}

/// Collaborators of the join loop.
pub struct JoinClientDeps {
    pub lock: Arc<NodeLock>,
    pub disk: Arc<dyn StateDisk>,
    pub metadata: Arc<dyn MetadataApi>,
    pub rpc: Arc<dyn JoinTicketClient>,
    pub joiner: Arc<dyn ClusterJoiner>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct JoinClient {
    worker: Arc<Worker>,
    running: Mutex<Option<Running>>,
    outcome: watch::Sender<Option<Result<(), JoinError>>>,
}

impl JoinClient {
    pub fn new(deps: JoinClientDeps, config: JoinClientConfig) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            worker: Arc::new(Worker { deps, config }),
            running: Mutex::new(None),
            outcome,
        }
    }

    /// Start the join loop in the background. Does nothing if it is already
    /// running or has finished without being stopped.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        // Forget the outcome of a previous, stopped loop.
        self.outcome.send_replace(None);
        let cancel = CancellationToken::new();
        let worker = self.worker.clone();
        let outcome = self.outcome.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = worker.run(token).await;
            match &result {
                Ok(()) => info!("join loop finished"),
                Err(e) => warn!(error = %e, "join loop failed"),
            }
            outcome.send_replace(Some(result));
        });
        *running = Some(Running { cancel, handle });
        info!("join client started");
    }

    /// Stop the join loop and wait until it has exited. An attempt already in
    /// flight runs to completion first. A no-op if the loop is not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { cancel, handle }) = running.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "join loop task panicked");
        }
        info!("join client stopped");
    }

    /// Wait for the join loop to finish and return its outcome.
    ///
    /// Returns [`JoinError::NotStarted`] right away if no loop is running and
    /// none has finished.
    pub async fn wait(&self) -> Result<(), JoinError> {
        let mut rx = {
            let running = self.running.lock().await;
            let rx = self.outcome.subscribe();
            if running.is_none() && rx.borrow().is_none() {
                return Err(JoinError::NotStarted);
            }
            rx
        };
        let outcome = rx.wait_for(Option::is_some).await.map(|o| o.clone());
        match outcome {
            Ok(Some(result)) => result,
            _ => Err(JoinError::Stopped),
        }
    }
}

enum Attempt {
    Retry,
    Done(Result<(), JoinError>),
}

struct Worker {
    deps: JoinClientDeps,
    config: JoinClientConfig,
}

impl Worker {
    async fn run(&self, cancel: CancellationToken) -> Result<(), JoinError> {
        let deadline = tokio::time::sleep(self.config.join_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JoinError::Stopped),
                _ = &mut deadline => return Err(JoinError::Timeout(self.config.join_timeout)),
                _ = ticker.tick() => {
                    if let Attempt::Done(result) = self.attempt().await {
                        return result;
                    }
                }
            }
        }
    }

    async fn attempt(&self) -> Attempt {
        let call_timeout = self.config.call_timeout;

        let me = match timeout(call_timeout, self.deps.metadata.self_instance()).await {
            Ok(Ok(me)) if is_valid(&me) => me,
            Ok(Ok(me)) => {
                debug!(name = %me.name, role = %me.role, "self metadata incomplete");
                return Attempt::Retry;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to get self metadata");
                return Attempt::Retry;
            }
            Err(_) => {
                warn!("self metadata request timed out");
                return Attempt::Retry;
            }
        };

        let peers = match timeout(call_timeout, self.deps.metadata.list()).await {
            Ok(Ok(peers)) => peers,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to list peers");
                return Attempt::Retry;
            }
            Err(_) => {
                warn!("peer list request timed out");
                return Attempt::Retry;
            }
        };
        let endpoints = control_plane_endpoints(&peers, self.config.join_service_port);
        if endpoints.is_empty() {
            debug!("no control plane endpoints found");
            return Attempt::Retry;
        }

        if self.deps.lock.is_locked() {
            info!("node lock already held, join is in progress elsewhere");
            return Attempt::Done(Ok(()));
        }

        let disk_uuid = match self.deps.disk.uuid().await {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!(error = %e, "failed to read state disk UUID");
                return Attempt::Retry;
            }
        };
        let req = IssueJoinTicketRequest {
            disk_uuid,
            node_name: me.node_name(),
            is_control_plane: me.role == Role::ControlPlane,
        };

        let Some(ticket) = self.request_ticket(&endpoints, &req).await else {
            return Attempt::Retry;
        };

        if !self.deps.lock.try_lock_once() {
            info!("node lock taken concurrently, dropping ticket");
            return Attempt::Done(Ok(()));
        }
        Attempt::Done(self.apply(&me, &ticket).await)
    }

    async fn request_ticket(
        &self,
        endpoints: &[String],
        req: &IssueJoinTicketRequest,
    ) -> Option<IssueJoinTicketResponse> {
        for endpoint in endpoints {
            match timeout(
                self.config.call_timeout,
                self.deps.rpc.issue_join_ticket(endpoint, req),
            )
            .await
            {
                Ok(Ok(ticket)) => {
                    info!(%endpoint, "join ticket received");
                    return Some(ticket);
                }
                Ok(Err(e)) => warn!(%endpoint, error = %format!("{e:#}"), "join ticket request failed"),
                Err(_) => warn!(%endpoint, "join ticket request timed out"),
            }
        }
        None
    }

    async fn apply(
        &self,
        me: &InstanceMetadata,
        ticket: &IssueJoinTicketResponse,
    ) -> Result<(), JoinError> {
        self.deps
            .disk
            .open(&ticket.state_disk_key)
            .await
            .map_err(|e| JoinError::StateDisk(format!("{e:#}")))?;

        if !ticket.control_plane_files.is_empty() {
            write_control_plane_files(&self.config.pki_dir, &ticket.control_plane_files)
                .await
                .map_err(|e| JoinError::ControlPlaneFiles(format!("{e:#}")))?;
        }

        self.deps
            .joiner
            .join(me, ticket)
            .await
            .map_err(|e| JoinError::Join(format!("{e:#}")))?;
        info!(node = %me.node_name(), role = %me.role, "node joined the cluster");
        Ok(())
    }
}

fn is_valid(me: &InstanceMetadata) -> bool {
    !me.name.is_empty() && me.role != Role::Unknown
}
