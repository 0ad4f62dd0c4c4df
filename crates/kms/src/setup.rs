//! Backend selection from configuration URIs.
//!
//! A URI's scheme and host pick a backend from a fixed registry; its query
//! string must carry exactly the parameters that backend declares. Anything
//! else is a [`ConfigError`] raised before the service starts.
//!
//! | URI | Backend |
//! |-----|---------|
//! | `storage://no-store` | [`MemoryStore`] |
//! | `storage://aws?bucket=&region=` | [`S3Store`] |
//! | `kms://cluster-kms` | [`ClusterKekSource`] |
//! | `kms://aws?region=` | [`AwsKmsKekSource`] |
//! | `kms://aws-secrets?region=` | [`SecretsManagerKekSource`] |

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::backend::aws::{self, AwsKmsKekSource, S3Store, SecretsManagerKekSource};
use crate::backend::{ClusterKekSource, KekSource, MemoryStore, WrappedKeyStore};
use crate::KmsCoordinator;

/// Configuration-time errors. None of these are retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported backend {scheme}://{host}")]
    UnsupportedBackend { scheme: String, host: String },

    #[error("missing parameter {0}")]
    MissingParameter(&'static str),

    #[error("parameter {0} must not be empty")]
    EmptyParameter(&'static str),

    #[error("unexpected parameter {0}")]
    UnexpectedParameter(String),

    #[error("parameter {0} given more than once")]
    DuplicateParameter(String),

    #[error("backend {0} requires a master secret")]
    MissingMasterSecret(&'static str),

    #[error("backend initialisation failed: {0}")]
    Backend(String),
}

/// Wrapped-DEK store selected by a `storage://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    NoStore,
    Aws { bucket: String, region: String },
}

/// KEK source selected by a `kms://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KekBackend {
    ClusterKms,
    Aws { region: String },
    AwsSecrets { region: String },
}

struct BackendScheme {
    scheme: &'static str,
    host: &'static str,
    params: &'static [&'static str],
}

const STORAGE_NO_STORE: BackendScheme = BackendScheme {
    scheme: "storage",
    host: "no-store",
    params: &[],
};
const STORAGE_AWS: BackendScheme = BackendScheme {
    scheme: "storage",
    host: "aws",
    params: &["bucket", "region"],
};
const KMS_CLUSTER: BackendScheme = BackendScheme {
    scheme: "kms",
    host: "cluster-kms",
    params: &[],
};
const KMS_AWS: BackendScheme = BackendScheme {
    scheme: "kms",
    host: "aws",
    params: &["region"],
};
const KMS_AWS_SECRETS: BackendScheme = BackendScheme {
    scheme: "kms",
    host: "aws-secrets",
    params: &["region"],
};

const REGISTRY: &[&BackendScheme] = &[
    &STORAGE_NO_STORE,
    &STORAGE_AWS,
    &KMS_CLUSTER,
    &KMS_AWS,
    &KMS_AWS_SECRETS,
];

impl StorageBackend {
    /// Parse a `storage://` URI.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, values) = lookup(uri, "storage")?;
        match scheme.host {
            "no-store" => Ok(Self::NoStore),
            _ => {
                let [bucket, region] = take::<2>(values);
                Ok(Self::Aws { bucket, region })
            }
        }
    }
}

impl KekBackend {
    /// Parse a `kms://` URI.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, values) = lookup(uri, "kms")?;
        match scheme.host {
            "cluster-kms" => Ok(Self::ClusterKms),
            "aws" => {
                let [region] = take::<1>(values);
                Ok(Self::Aws { region })
            }
            _ => {
                let [region] = take::<1>(values);
                Ok(Self::AwsSecrets { region })
            }
        }
    }
}

/// Find the registry entry for `uri` and return its parameter values in
/// declaration order.
fn lookup(uri: &str, scheme: &str) -> Result<(&'static BackendScheme, Vec<String>), ConfigError> {
    let parsed = Url::parse(uri).map_err(|e| ConfigError::InvalidUri {
        uri: uri.to_owned(),
        reason: e.to_string(),
    })?;
    let host = parsed.host_str().unwrap_or_default();

    let entry = REGISTRY
        .iter()
        .copied()
        .find(|s| s.scheme == scheme && parsed.scheme() == s.scheme && s.host == host)
        .ok_or_else(|| ConfigError::UnsupportedBackend {
            scheme: parsed.scheme().to_owned(),
            host: host.to_owned(),
        })?;

    if !parsed.path().is_empty() && parsed.path() != "/" {
        return Err(ConfigError::InvalidUri {
            uri: uri.to_owned(),
            reason: "path is not allowed".into(),
        });
    }

    let values = get_config(&parsed, entry.params)?;
    Ok((entry, values))
}

/// Extract exactly `params` from the query string, in order.
fn get_config(url: &Url, params: &[&'static str]) -> Result<Vec<String>, ConfigError> {
    let mut query: HashMap<String, String> = HashMap::new();
    for (name, value) in url.query_pairs() {
        if !params.iter().any(|p| *p == &*name) {
            return Err(ConfigError::UnexpectedParameter(name.into_owned()));
        }
        if query.insert(name.to_string(), value.into_owned()).is_some() {
            return Err(ConfigError::DuplicateParameter(name.into_owned()));
        }
    }

    params
        .iter()
        .map(|&param| match query.remove(param) {
            None => Err(ConfigError::MissingParameter(param)),
            Some(v) if v.is_empty() => Err(ConfigError::EmptyParameter(param)),
            Some(v) => Ok(v),
        })
        .collect()
}

fn take<const N: usize>(values: Vec<String>) -> [String; N] {
    let mut it = values.into_iter();
    std::array::from_fn(|_| it.next().unwrap_or_default())
}

/// Instantiate the wrapped-DEK store.
pub async fn build_store(backend: &StorageBackend) -> Arc<dyn WrappedKeyStore> {
    match backend {
        StorageBackend::NoStore => Arc::new(MemoryStore::new()),
        StorageBackend::Aws { bucket, region } => {
            let config = aws::sdk_config(region).await;
            Arc::new(S3Store::new(&config, bucket.clone()))
        }
    }
}

/// Instantiate the KEK source. `cluster-kms` needs the master secret.
pub async fn build_kek_source(
    backend: &KekBackend,
    master_secret: Option<&[u8]>,
) -> Result<Arc<dyn KekSource>, ConfigError> {
    match backend {
        KekBackend::ClusterKms => {
            let secret = master_secret.ok_or(ConfigError::MissingMasterSecret("kms://cluster-kms"))?;
            let source =
                ClusterKekSource::new(secret).map_err(|e| ConfigError::Backend(e.to_string()))?;
            Ok(Arc::new(source))
        }
        KekBackend::Aws { region } => {
            let config = aws::sdk_config(region).await;
            Ok(Arc::new(AwsKmsKekSource::new(&config)))
        }
        KekBackend::AwsSecrets { region } => {
            let config = aws::sdk_config(region).await;
            Ok(Arc::new(SecretsManagerKekSource::new(&config)))
        }
    }
}

/// Parse both URIs and assemble a [`KmsCoordinator`].
pub async fn setup(
    storage_uri: &str,
    kms_uri: &str,
    master_secret: Option<&[u8]>,
) -> Result<KmsCoordinator, ConfigError> {
    let storage = StorageBackend::from_uri(storage_uri)?;
    let kek = KekBackend::from_uri(kms_uri)?;
    info!(?storage, ?kek, "configuring key custody backends");

    let kek_source = build_kek_source(&kek, master_secret).await?;
    let store = build_store(&storage).await;
    Ok(KmsCoordinator::new(kek_source, store))
}
