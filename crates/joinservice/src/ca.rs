//! Certificate-authority collaborator and kubelet key/CSR generation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::CertificateSigningRequestDer;
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

/// Signs certificate requests with the cluster CA.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Sign a DER-encoded CSR and return the PEM certificate.
    async fn get_certificate(&self, csr_der: &[u8]) -> Result<Vec<u8>>;
}

/// Kubernetes cluster CA read from `<pki>/ca.crt` and `<pki>/ca.key`.
#[derive(Debug, Clone)]
pub struct KubernetesCa {
    pki_dir: PathBuf,
}

impl KubernetesCa {
    pub fn new(pki_dir: impl Into<PathBuf>) -> Self {
        Self {
            pki_dir: pki_dir.into(),
        }
    }
}

#[async_trait]
impl CertificateAuthority for KubernetesCa {
    async fn get_certificate(&self, csr_der: &[u8]) -> Result<Vec<u8>> {
        let cert_path = self.pki_dir.join("ca.crt");
        let key_path = self.pki_dir.join("ca.key");
        let ca_cert_pem = tokio::fs::read_to_string(&cert_path)
            .await
            .with_context(|| format!("failed to read {}", cert_path.display()))?;
        let ca_key_pem = Zeroizing::new(
            tokio::fs::read_to_string(&key_path)
                .await
                .with_context(|| format!("failed to read {}", key_path.display()))?,
        );

        sign_csr(&ca_cert_pem, &ca_key_pem, csr_der)
    }
}

/// Sign `csr_der` as a client certificate issued by the given CA.
pub fn sign_csr(ca_cert_pem: &str, ca_key_pem: &str, csr_der: &[u8]) -> Result<Vec<u8>> {
    let ca_key = KeyPair::from_pem(ca_key_pem).context("failed to parse CA key")?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key).context("failed to parse CA certificate")?;

    let mut csr = CertificateSigningRequestParams::from_der(&CertificateSigningRequestDer::from(
        csr_der.to_vec(),
    ))
    .context("failed to parse CSR")?;
    csr.params.is_ca = IsCa::ExplicitNoCa;
    csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let cert = csr.signed_by(&issuer).context("failed to sign CSR")?;
    Ok(cert.pem().into_bytes())
}

/// A freshly generated kubelet key and matching CSR.
pub struct KubeletCsr {
    /// PEM-encoded PKCS#8 private key.
    pub key_pem: Zeroizing<String>,
    pub csr_der: Vec<u8>,
}

/// Generate a kubelet key pair and a CSR for `system:node:<node_name>` in
/// group `system:nodes`.
pub fn kubelet_csr(node_name: &str) -> Result<KubeletCsr> {
    let key = KeyPair::generate().context("failed to generate kubelet key")?;

    let mut params = CertificateParams::new(Vec::<String>::new()).context("invalid CSR params")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("system:node:{node_name}"));
    dn.push(DnType::OrganizationName, "system:nodes");
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key)
        .context("failed to serialise kubelet CSR")?;

    Ok(KubeletCsr {
        key_pem: Zeroizing::new(key.serialize_pem()),
        csr_der: csr.der().to_vec(),
    })
}
