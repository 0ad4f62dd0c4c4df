//! rustls server configuration from PEM material.
//!
//! The attestation layer provisions the certificate and key on disk before the
//! services start; this module only turns them into a `rustls::ServerConfig`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ServerConfig;

/// Build a [`rustls::ServerConfig`] from PEM-encoded certificate and private key bytes.
///
/// # Errors
///
/// Returns an error if the certificate or key cannot be parsed, or if rustls
/// rejects the configuration.
pub fn build_server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse TLS certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in PEM data");
    }

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
        .context("failed to read TLS private key")?
        .context("no private key found in PEM data")?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build rustls ServerConfig")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Read a certificate/key pair from disk and build a server config.
///
/// Returns `Ok(None)` when neither path is set, so callers fall back to plain
/// HTTP; setting only one of the two is an error.
pub fn load_server_config(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<Option<Arc<ServerConfig>>> {
    match (cert_path, key_path) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => {
            let cert_pem = std::fs::read(cert)
                .with_context(|| format!("failed to read {}", cert.display()))?;
            let key_pem =
                std::fs::read(key).with_context(|| format!("failed to read {}", key.display()))?;
            build_server_config(&cert_pem, &key_pem).map(Some)
        }
        _ => anyhow::bail!("TLS_CERT_PATH and TLS_KEY_PATH must be set together"),
    }
}

/// Build a server config around a freshly generated self-signed certificate
/// for `names`.
///
/// Used by endpoints whose peers do not verify the server certificate, so
/// the channel is encrypted even when no certificate was provisioned.
///
/// # Errors
///
/// Returns an error if certificate generation fails.
pub fn self_signed_server_config(names: Vec<String>) -> Result<Arc<ServerConfig>> {
    let key = rcgen::KeyPair::generate().context("failed to generate TLS key pair")?;
    let cert = rcgen::CertificateParams::new(names)
        .context("invalid certificate subject names")?
        .self_signed(&key)
        .context("failed to self-sign TLS certificate")?;
    build_server_config(cert.pem().as_bytes(), key.serialize_pem().as_bytes())
}
