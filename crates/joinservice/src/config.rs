//! Configuration loading and validation for the join service.
//!
//! All values are read from environment variables at startup.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated join service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// KMS address (`host:port` or base URL). **Required.**
    pub kms_endpoint: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Directory holding the cluster identity record.
    #[serde(default = "default_service_base_path")]
    pub service_base_path: String,

    /// Kubernetes PKI directory (`ca.crt`, `ca.key` and the control-plane files).
    #[serde(default = "default_kubernetes_pki_dir")]
    pub kubernetes_pki_dir: String,

    /// Lifetime of issued bootstrap tokens, in seconds.
    #[serde(default = "default_join_token_ttl_secs")]
    pub join_token_ttl_secs: u64,

    /// Port restarting nodes listen on for pushed state-disk keys.
    #[serde(default = "default_key_release_port")]
    pub key_release_port: u16,

    /// Timeout for outbound calls to the KMS and to nodes, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// PEM certificate chain for serving TLS. Set together with `tls_key_path`.
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    #[serde(default)]
    pub tls_key_path: Option<String>,

    /// Root CA used to verify nodes when pushing keys. Without it the node's
    /// self-signed certificate is accepted; pushes always use TLS.
    #[serde(default)]
    pub tls_ca_path: Option<String>,

    /// OTLP collector endpoint. Spans are exported only when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    common::JOIN_SERVICE_PORT
}
fn default_service_base_path() -> String {
    "/var/config".into()
}
fn default_kubernetes_pki_dir() -> String {
    "/etc/kubernetes/pki".into()
}
fn default_join_token_ttl_secs() -> u64 {
    15 * 60
}
fn default_key_release_port() -> u16 {
    common::KEY_RELEASE_PORT
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration (is KMS_ENDPOINT set?)")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.kms_endpoint, "KMS_ENDPOINT")?;
        ensure_non_empty(&self.service_base_path, "SERVICE_BASE_PATH")?;
        ensure_non_empty(&self.kubernetes_pki_dir, "KUBERNETES_PKI_DIR")?;

        if self.join_token_ttl_secs == 0 {
            anyhow::bail!("JOIN_TOKEN_TTL_SECS must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be greater than zero");
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            anyhow::bail!("TLS_CERT_PATH and TLS_KEY_PATH must be set together");
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            kms_endpoint: "kms:9000".into(),
            listen_port: default_listen_port(),
            service_base_path: default_service_base_path(),
            kubernetes_pki_dir: default_kubernetes_pki_dir(),
            join_token_ttl_secs: default_join_token_ttl_secs(),
            key_release_port: default_key_release_port(),
            request_timeout_secs: default_request_timeout_secs(),
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_listen_port(), 30090);
        assert_eq!(default_key_release_port(), 9000);
        assert_eq!(default_join_token_ttl_secs(), 900);
        assert_eq!(default_service_base_path(), "/var/config");
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_kms_endpoint() {
        let cfg = Config {
            kms_endpoint: "  ".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let cfg = Config {
            join_token_ttl_secs: 0,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_tls_pair() {
        let cfg = Config {
            tls_cert_path: Some("/etc/tls/tls.crt".into()),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }
}
