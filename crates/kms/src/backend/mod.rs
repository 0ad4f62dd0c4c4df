//! Key-custody backends.
//!
//! A backend is the pair of capabilities the coordinator needs:
//! - a [`KekSource`] that resolves a KEK ID into something that can wrap and
//!   unwrap DEKs ([`Kek`]);
//! - a [`WrappedKeyStore`] holding at most one wrapped DEK per key ID.
//!
//! Variants are selected from configuration URIs in [`crate::setup`].

pub mod aws;
pub mod local;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use crate::crypto::CodecError;

pub use local::{ClusterKekSource, LocalKek, MemoryStore};

/// Errors produced by a [`WrappedKeyStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// No wrapped DEK is stored under this key ID.
    #[error("no wrapped key stored for {0}")]
    NotFound(String),

    /// A wrapped DEK is already stored under this key ID.
    #[error("a wrapped key is already stored for {0}")]
    AlreadyExists(String),

    /// The storage provider failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors produced while resolving or using a KEK.
#[derive(Debug, Error)]
pub enum KekError {
    /// The KEK does not exist in the configured provider.
    #[error("KEK {0} not found")]
    NotFound(String),

    /// Local wrap/unwrap failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The remote key-management provider failed.
    #[error("key provider error: {0}")]
    Provider(String),
}

/// Persistent map from key ID to wrapped DEK.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WrappedKeyStore: Send + Sync {
    /// Fetch the wrapped DEK for `key_id`.
    ///
    /// Returns [`StorageError::NotFound`] if nothing has been stored.
    async fn get(&self, key_id: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `wrapped` under `key_id` only if nothing is stored yet.
    ///
    /// Returns [`StorageError::AlreadyExists`] if another writer got there first;
    /// the existing value is never overwritten.
    async fn put_if_absent(&self, key_id: &str, wrapped: &[u8]) -> Result<(), StorageError>;
}

/// A resolved KEK.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Kek: Send + Sync {
    /// Wrap `dek`, binding it to `key_id`.
    async fn wrap_key(&self, key_id: &str, dek: &[u8]) -> Result<Vec<u8>, KekError>;

    /// Unwrap a value produced by [`Kek::wrap_key`] for the same `key_id`.
    async fn unwrap_key(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, KekError>;
}

/// Resolves KEK IDs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KekSource: Send + Sync {
    /// Look up `kek_id`. A missing KEK is [`KekError::NotFound`]; sources
    /// never create KEKs on demand.
    async fn resolve(&self, kek_id: &str) -> Result<Box<dyn Kek>, KekError>;
}
