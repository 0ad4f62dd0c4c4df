//! In-process backends: the `no-store` wrapped-key map and the cluster KEK
//! derived from the master secret.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use super::{Kek, KekError, KekSource, StorageError, WrappedKeyStore};
use crate::crypto::{KekBytes, KeyWrapCodec, WrappedDek};

/// Minimum accepted master secret length.
pub const MIN_MASTER_SECRET_LEN: usize = 32;

/// Wrapped DEKs kept in memory. Used for development and for clusters that
/// hold no external key custody.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl WrappedKeyStore for MemoryStore {
    async fn get(&self, key_id: &str) -> Result<Vec<u8>, StorageError> {
        self.inner
            .read()
            .await
            .get(key_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key_id.to_owned()))
    }

    async fn put_if_absent(&self, key_id: &str, wrapped: &[u8]) -> Result<(), StorageError> {
        let mut map = self.inner.write().await;
        if map.contains_key(key_id) {
            return Err(StorageError::AlreadyExists(key_id.to_owned()));
        }
        map.insert(key_id.to_owned(), wrapped.to_vec());
        Ok(())
    }
}

/// A KEK held in memory; wraps locally with [`KeyWrapCodec`].
pub struct LocalKek {
    codec: KeyWrapCodec,
}

impl LocalKek {
    pub fn new(kek: &KekBytes) -> Result<Self, KekError> {
        Ok(Self {
            codec: KeyWrapCodec::new(kek)?,
        })
    }
}

#[async_trait]
impl Kek for LocalKek {
    async fn wrap_key(&self, key_id: &str, dek: &[u8]) -> Result<Vec<u8>, KekError> {
        let wrapped = self.codec.wrap(key_id, dek)?;
        Ok(wrapped.to_string_repr().into_bytes())
    }

    async fn unwrap_key(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, KekError> {
        let repr = std::str::from_utf8(wrapped)
            .map_err(|_| KekError::Codec(crate::crypto::CodecError::InvalidFormat))?;
        let wrapped = WrappedDek::parse(repr)?;
        Ok(self.codec.unwrap(key_id, &wrapped)?)
    }
}

/// KEKs derived from the cluster master secret.
///
/// Every KEK ID resolves: the KEK is `HMAC-SHA256(master_secret, kek_id)`, so
/// the same master secret always yields the same KEK for an ID.
pub struct ClusterKekSource {
    master_secret: Zeroizing<Vec<u8>>,
}

impl ClusterKekSource {
    /// # Errors
    ///
    /// Returns [`KekError::Provider`] if the secret is shorter than
    /// [`MIN_MASTER_SECRET_LEN`].
    pub fn new(master_secret: &[u8]) -> Result<Self, KekError> {
        if master_secret.len() < MIN_MASTER_SECRET_LEN {
            return Err(KekError::Provider(format!(
                "master secret must be at least {MIN_MASTER_SECRET_LEN} bytes, got {}",
                master_secret.len()
            )));
        }
        Ok(Self {
            master_secret: Zeroizing::new(master_secret.to_vec()),
        })
    }

    /// Infallible constructor for a secret of exactly the minimum length.
    pub fn from_array(master_secret: [u8; MIN_MASTER_SECRET_LEN]) -> Self {
        Self {
            master_secret: Zeroizing::new(master_secret.to_vec()),
        }
    }

    fn derive(&self, kek_id: &str) -> Result<KekBytes, KekError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.master_secret)
            .map_err(|e| KekError::Provider(e.to_string()))?;
        mac.update(kek_id.as_bytes());
        let derived = Zeroizing::new(mac.finalize().into_bytes().to_vec());
        Ok(KekBytes::from_slice(&derived)?)
    }
}

#[async_trait]
impl KekSource for ClusterKekSource {
    async fn resolve(&self, kek_id: &str) -> Result<Box<dyn Kek>, KekError> {
        let kek = self.derive(kek_id)?;
        Ok(Box::new(LocalKek::new(&kek)?))
    }
}
