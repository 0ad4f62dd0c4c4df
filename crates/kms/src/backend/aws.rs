//! AWS-backed custody: S3 for wrapped DEKs, KMS or Secrets Manager for KEKs.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;
use zeroize::Zeroizing;

use super::{Kek, KekError, KekSource, LocalKek, StorageError, WrappedKeyStore};
use crate::crypto::KekBytes;

/// Encryption-context key binding a KMS ciphertext to its DEK key ID.
const KEY_ID_CONTEXT: &str = "key_id";

/// Object key prefix for wrapped DEKs in the bucket.
const OBJECT_PREFIX: &str = "wrapped-deks/";

/// Retries of a conditional put that S3 answered with 409.
const CONFLICT_RETRIES: usize = 3;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

/// Load the shared SDK configuration for `region`.
///
/// Credentials come from the standard AWS credential chain (instance role).
pub async fn sdk_config(region: &str) -> aws_config::SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_owned()))
        .load()
        .await
}

// ---------------------------------------------------------------------------
// S3 wrapped-key store
// ---------------------------------------------------------------------------

/// One S3 object per key ID, created with `If-None-Match: *`.
#[derive(Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(config: &aws_config::SdkConfig, bucket: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(config),
            bucket: bucket.into(),
        }
    }

    fn object_key(key_id: &str) -> String {
        format!("{OBJECT_PREFIX}{key_id}")
    }
}

#[async_trait]
impl WrappedKeyStore for S3Store {
    async fn get(&self, key_id: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::object_key(key_id))
            .send()
            .await
            .map_err(|e| match e.into_service_error() {
                err if err.is_no_such_key() => StorageError::NotFound(key_id.to_owned()),
                err => StorageError::Backend(err.to_string()),
            })?;

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn put_if_absent(&self, key_id: &str, wrapped: &[u8]) -> Result<(), StorageError> {
        let mut conflicts = 0;
        loop {
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(Self::object_key(key_id))
                .if_none_match("*")
                .body(ByteStream::from(wrapped.to_vec()))
                .send()
                .await;
            let err = match result {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };

            match classify_put_rejection(err.raw_response().map(|r| r.status().as_u16())) {
                PutRejection::Exists => {
                    debug!(key_id, "wrapped key already stored");
                    return Err(StorageError::AlreadyExists(key_id.to_owned()));
                }
                PutRejection::Conflict if conflicts < CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(key_id, conflicts, "conditional write conflict, retrying");
                    tokio::time::sleep(CONFLICT_BACKOFF).await;
                }
                PutRejection::Conflict => {
                    return Err(StorageError::Backend(format!(
                        "conditional write for {key_id} kept conflicting"
                    )));
                }
                PutRejection::Failed => {
                    return Err(StorageError::Backend(err.into_service_error().to_string()));
                }
            }
        }
    }
}

/// How S3 turned down a conditional put.
#[derive(Debug, PartialEq, Eq)]
enum PutRejection {
    /// 412: the object exists.
    Exists,
    /// 409: another conditional write on the key is in flight.
    Conflict,
    Failed,
}

fn classify_put_rejection(status: Option<u16>) -> PutRejection {
    match status {
        Some(412) => PutRejection::Exists,
        Some(409) => PutRejection::Conflict,
        _ => PutRejection::Failed,
    }
}

// ---------------------------------------------------------------------------
// AWS KMS KEKs
// ---------------------------------------------------------------------------

/// KEKs are AWS KMS keys; wrapping happens server-side.
#[derive(Clone)]
pub struct AwsKmsKekSource {
    client: aws_sdk_kms::Client,
}

impl AwsKmsKekSource {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_kms::Client::new(config),
        }
    }
}

#[async_trait]
impl KekSource for AwsKmsKekSource {
    async fn resolve(&self, kek_id: &str) -> Result<Box<dyn Kek>, KekError> {
        let resp = self
            .client
            .describe_key()
            .key_id(kek_id)
            .send()
            .await
            .map_err(|e| match e.into_service_error() {
                err if err.is_not_found_exception() => KekError::NotFound(kek_id.to_owned()),
                err => KekError::Provider(err.to_string()),
            })?;

        let key_arn = resp
            .key_metadata()
            .and_then(|m| m.arn())
            .map(str::to_owned)
            .unwrap_or_else(|| kek_id.to_owned());

        Ok(Box::new(AwsKmsKek {
            client: self.client.clone(),
            key_arn,
        }))
    }
}

struct AwsKmsKek {
    client: aws_sdk_kms::Client,
    key_arn: String,
}

#[async_trait]
impl Kek for AwsKmsKek {
    async fn wrap_key(&self, key_id: &str, dek: &[u8]) -> Result<Vec<u8>, KekError> {
        let resp = self
            .client
            .encrypt()
            .key_id(&self.key_arn)
            .plaintext(Blob::new(dek.to_vec()))
            .encryption_context(KEY_ID_CONTEXT, key_id)
            .send()
            .await
            .map_err(|e| KekError::Provider(e.into_service_error().to_string()))?;

        resp.ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| KekError::Provider("KMS encrypt returned no ciphertext".into()))
    }

    async fn unwrap_key(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, KekError> {
        let resp = self
            .client
            .decrypt()
            .key_id(&self.key_arn)
            .ciphertext_blob(Blob::new(wrapped.to_vec()))
            .encryption_context(KEY_ID_CONTEXT, key_id)
            .send()
            .await
            .map_err(|e| KekError::Provider(e.into_service_error().to_string()))?;

        resp.plaintext()
            .map(|p| Zeroizing::new(p.as_ref().to_vec()))
            .ok_or_else(|| KekError::Provider("KMS decrypt returned no plaintext".into()))
    }
}

// ---------------------------------------------------------------------------
// Secrets Manager KEKs
// ---------------------------------------------------------------------------

/// KEKs are 32-byte binary secrets named by KEK ID; wrapping happens locally.
#[derive(Clone)]
pub struct SecretsManagerKekSource {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerKekSource {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_secretsmanager::Client::new(config),
        }
    }
}

#[async_trait]
impl KekSource for SecretsManagerKekSource {
    async fn resolve(&self, kek_id: &str) -> Result<Box<dyn Kek>, KekError> {
        let secret = self
            .client
            .get_secret_value()
            .secret_id(kek_id)
            .send()
            .await
            .map_err(|e| match e.into_service_error() {
                err if err.is_resource_not_found_exception() => {
                    KekError::NotFound(kek_id.to_owned())
                }
                err => KekError::Provider(err.to_string()),
            })?;

        let bytes = secret
            .secret_binary()
            .ok_or_else(|| KekError::Provider(format!("KEK secret {kek_id} must be stored as binary")))?;
        let kek = KekBytes::from_slice(bytes.as_ref())?;
        Ok(Box::new(LocalKek::new(&kek)?))
    }
}
