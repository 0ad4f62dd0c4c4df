//! Configuration loading and validation for the bootstrapper.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated bootstrapper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Metadata provider address (`host:port` or base URL). **Required.**
    pub metadata_endpoint: String,

    /// Block device backing the state disk. **Required.**
    pub state_disk_device: String,

    /// Name of the mapped state disk under `/dev/mapper`.
    #[serde(default = "default_state_disk_mapping")]
    pub state_disk_mapping: String,

    /// Add dm-integrity below dm-crypt when formatting.
    #[serde(default)]
    pub state_disk_integrity: bool,

    #[serde(default = "default_join_service_port")]
    pub join_service_port: u16,

    /// Port the key release endpoint listens on while restarting.
    #[serde(default = "default_key_release_port")]
    pub key_release_port: u16,

    #[serde(default = "default_join_interval_secs")]
    pub join_interval_secs: u64,

    /// Bound on each metadata, ticket or key request call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Bound on the whole join loop.
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    /// Receives the kubeadm join configuration and `pki/`.
    #[serde(default = "default_kubeadm_config_dir")]
    pub kubeadm_config_dir: String,

    /// Root CA of the join service. Requests use plain HTTP when unset.
    #[serde(default)]
    pub tls_ca_path: Option<String>,

    /// Certificate for the key release endpoint. Set together with `tls_key_path`;
    /// a self-signed certificate is generated when both are unset.
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    #[serde(default)]
    pub tls_key_path: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_state_disk_mapping() -> String {
    "state".into()
}
fn default_join_service_port() -> u16 {
    common::JOIN_SERVICE_PORT
}
fn default_key_release_port() -> u16 {
    common::KEY_RELEASE_PORT
}
fn default_join_interval_secs() -> u64 {
    5
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_join_timeout_secs() -> u64 {
    30 * 60
}
fn default_kubeadm_config_dir() -> String {
    "/etc/kubernetes".into()
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

        let c: Config = cfg.try_deserialize().context(
            "failed to deserialise configuration (are METADATA_ENDPOINT and STATE_DISK_DEVICE set?)",
        )?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.metadata_endpoint, "METADATA_ENDPOINT")?;
        ensure_non_empty(&self.state_disk_device, "STATE_DISK_DEVICE")?;
        ensure_non_empty(&self.state_disk_mapping, "STATE_DISK_MAPPING")?;
        if self.state_disk_mapping.contains('/') {
            anyhow::bail!("STATE_DISK_MAPPING must be a plain name");
        }
        ensure_non_empty(&self.kubeadm_config_dir, "KUBEADM_CONFIG_DIR")?;

        for (value, name) in [
            (self.join_interval_secs, "JOIN_INTERVAL_SECS"),
            (self.call_timeout_secs, "CALL_TIMEOUT_SECS"),
            (self.join_timeout_secs, "JOIN_TIMEOUT_SECS"),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            anyhow::bail!("TLS_CERT_PATH and TLS_KEY_PATH must be set together");
        }
        Ok(())
    }

    pub fn join_interval(&self) -> Duration {
        Duration::from_secs(self.join_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
