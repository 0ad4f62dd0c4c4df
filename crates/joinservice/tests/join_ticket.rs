//! Join ticket issuance against a real KMS served over HTTP, a real CA on
//! disk and a scripted `kubeadm`.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::protocol::{IssueJoinTicketRequest, IssueJoinTicketResponse};
use joinservice::ca::KubernetesCa;
use joinservice::keypush::KeyPusher;
use joinservice::kms_client::{DataKeyGetter, KmsClient};
use joinservice::kubeadm::{ClusterAdmin, JoinToken};
use joinservice::server::{router, state::AppState};
use joinservice::JoinTicketIssuer;
use kms::backend::{ClusterKekSource, MemoryStore};
use kms::KmsCoordinator;
use rcgen::{CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct ScriptedKubeadm;

#[async_trait]
impl ClusterAdmin for ScriptedKubeadm {
    async fn get_join_token(&self, _ttl: Duration) -> Result<JoinToken> {
        Ok(JoinToken {
            api_server_endpoint: "10.0.0.1:6443".into(),
            token: "abcdef.0123456789abcdef".into(),
            ca_cert_hash: "sha256:1234".into(),
        })
    }

    async fn get_control_plane_certificate_key(&self) -> Result<String> {
        Ok("a".repeat(64))
    }

    async fn get_control_plane_certificates_and_keys(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(BTreeMap::from([("ca.crt".to_owned(), b"CA".to_vec())]))
    }
}

#[derive(Default)]
struct RecordingPusher {
    pushed: Mutex<Vec<(IpAddr, Vec<u8>)>>,
}

#[async_trait]
impl KeyPusher for RecordingPusher {
    async fn push_state_disk_key(&self, node_ip: IpAddr, key: &[u8]) -> Result<()> {
        self.pushed.lock().await.push((node_ip, key.to_vec()));
        Ok(())
    }
}

async fn spawn(router: axum::Router, shutdown: &CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(common::serve::serve(listener, router, None, shutdown.clone()));
    addr
}

fn write_pki(dir: &Path) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, "kubernetes");
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let cert = params.self_signed(&key).unwrap();
    std::fs::write(dir.join("ca.crt"), cert.pem()).unwrap();
    std::fs::write(dir.join("ca.key"), key.serialize_pem()).unwrap();
}

struct Cluster {
    coordinator: KmsCoordinator,
    pusher: Arc<RecordingPusher>,
    join_addr: SocketAddr,
    shutdown: CancellationToken,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn cluster() -> Cluster {
    let shutdown = CancellationToken::new();

    let coordinator = KmsCoordinator::new(
        Arc::new(ClusterKekSource::from_array([7; 32])),
        Arc::new(MemoryStore::new()),
    );
    let kms_state = kms::server::state::AppState::new(coordinator.clone(), "cluster-kek".to_owned());
    let kms_addr = spawn(kms::server::router::build(kms_state), &shutdown).await;

    let base = tempfile::tempdir().unwrap();
    std::fs::write(
        base.path().join("id"),
        r#"{"owner_id":"b3duZXI=","cluster_id":"Y2x1c3Rlcg=="}"#,
    )
    .unwrap();
    let pki = tempfile::tempdir().unwrap();
    write_pki(pki.path());

    let kms_client: Arc<dyn DataKeyGetter> =
        Arc::new(KmsClient::new(&kms_addr.to_string(), Duration::from_secs(5)).unwrap());
    let issuer = JoinTicketIssuer::new(
        kms_client.clone(),
        Arc::new(ScriptedKubeadm),
        Arc::new(KubernetesCa::new(pki.path())),
        base.path(),
        Duration::from_secs(900),
    );
    let pusher = Arc::new(RecordingPusher::default());
    let state = AppState::new(issuer, kms_client, pusher.clone());
    let join_addr = spawn(router::build(state), &shutdown).await;

    Cluster {
        coordinator,
        pusher,
        join_addr,
        shutdown,
        _dirs: (base, pki),
    }
}

async fn request_ticket(addr: SocketAddr, req: &IssueJoinTicketRequest) -> IssueJoinTicketResponse {
    reqwest::Client::new()
        .post(format!("http://{addr}/v1/join-ticket"))
        .json(req)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn ticket_carries_the_kms_key_for_the_disk() {
    let c = cluster().await;

    let ticket = request_ticket(
        c.join_addr,
        &IssueJoinTicketRequest {
            disk_uuid: "uuid-A".into(),
            node_name: "worker-1".into(),
            is_control_plane: false,
        },
    )
    .await;

    let expected = c.coordinator.get_dek("cluster-kek", "uuid-A", 64).await.unwrap();
    assert_eq!(ticket.state_disk_key, *expected);
    assert_eq!(ticket.owner_id, b"owner");
    assert_eq!(ticket.cluster_id, b"cluster");
    assert!(ticket.certificate_key.is_none());
    assert!(ticket.control_plane_files.is_empty());
    assert!(String::from_utf8(ticket.kubelet_cert)
        .unwrap()
        .starts_with("-----BEGIN CERTIFICATE-----"));

    c.shutdown.cancel();
}

#[tokio::test]
async fn repeated_tickets_for_one_disk_share_the_key() {
    let c = cluster().await;
    let req = IssueJoinTicketRequest {
        disk_uuid: "uuid-B".into(),
        node_name: "cp-2".into(),
        is_control_plane: true,
    };

    let first = request_ticket(c.join_addr, &req).await;
    let second = request_ticket(c.join_addr, &req).await;
    assert_eq!(first.state_disk_key, second.state_disk_key);
    assert_eq!(first.certificate_key.as_deref(), Some("a".repeat(64).as_str()));
    assert_eq!(first.control_plane_files["ca.crt"], b"CA");

    c.shutdown.cancel();
}

#[tokio::test]
async fn key_request_pushes_the_same_key_to_the_caller() {
    let c = cluster().await;

    let status = reqwest::Client::new()
        .post(format!("http://{}/v1/state-disk-key/request", c.join_addr))
        .json(&serde_json::json!({"disk_uuid": "uuid-C"}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 204);

    let expected = c.coordinator.get_dek("cluster-kek", "uuid-C", 64).await.unwrap();
    let pushed = c.pusher.pushed.lock().await;
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].0, IpAddr::from([127, 0, 0, 1]));
    assert_eq!(pushed[0].1, *expected);

    c.shutdown.cancel();
}
