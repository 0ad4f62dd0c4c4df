//! Configuration loading and validation for the KMS.
//!
//! All values are read from environment variables at startup. Backend URIs are
//! parsed here so that a malformed URI stops the process before it binds.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::setup::{KekBackend, StorageBackend};

/// Validated KMS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Wrapped-DEK store URI.
    #[serde(default = "default_storage_uri")]
    pub storage_uri: String,

    /// KEK source URI.
    #[serde(default = "default_kms_uri")]
    pub kms_uri: String,

    /// File holding the cluster master secret. **Required** for `kms://cluster-kms`.
    #[serde(default)]
    pub master_secret_path: Option<String>,

    /// KEK all data keys are wrapped under.
    #[serde(default = "default_kek_id")]
    pub kek_id: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// OTLP collector endpoint. Spans are exported only when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_storage_uri() -> String {
    "storage://no-store".into()
}
fn default_kms_uri() -> String {
    "kms://cluster-kms".into()
}
fn default_kek_id() -> String {
    "cluster-kek".into()
}
fn default_listen_port() -> u16 {
    9000
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
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        StorageBackend::from_uri(&self.storage_uri).context("STORAGE_URI is invalid")?;
        let kek = KekBackend::from_uri(&self.kms_uri).context("KMS_URI is invalid")?;
        ensure_non_empty(&self.kek_id, "KEK_ID")?;

        if kek == KekBackend::ClusterKms {
            match &self.master_secret_path {
                Some(path) => ensure_non_empty(path, "MASTER_SECRET_PATH")?,
                None => anyhow::bail!("MASTER_SECRET_PATH is required for kms://cluster-kms"),
            }
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
