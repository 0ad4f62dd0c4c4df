//! [`KmsCoordinator`]: get-or-create DEKs under a KEK.
//!
//! # Invariants
//!
//! - A key ID maps to at most one wrapped DEK, ever. Every `get_dek` for the
//!   same key ID returns the same plaintext.
//! - A freshly generated DEK is only returned after it has been persisted. The
//!   loser of a concurrent first-use race discards its own key and returns the
//!   winner's.
//! - KEKs are never created here.

use std::sync::Arc;

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::backend::{Kek, KekSource, StorageError, WrappedKeyStore};
use crate::crypto::codec::random_bytes;
use crate::error::KmsError;

/// Largest DEK the coordinator will generate.
pub const MAX_DEK_LEN: usize = 4096;

/// Plaintext DEK, zeroed on drop.
pub type DataKey = Zeroizing<Vec<u8>>;

/// Combines a [`KekSource`] and a [`WrappedKeyStore`] into the get-or-create
/// DEK operation.
#[derive(Clone)]
pub struct KmsCoordinator {
    kek_source: Arc<dyn KekSource>,
    store: Arc<dyn WrappedKeyStore>,
}

impl KmsCoordinator {
    pub fn new(kek_source: Arc<dyn KekSource>, store: Arc<dyn WrappedKeyStore>) -> Self {
        Self { kek_source, store }
    }

    /// Return the DEK named `key_id` under `kek_id`, generating and persisting
    /// a `size`-byte key on first use.
    ///
    /// # Errors
    ///
    /// - [`KmsError::InvalidLength`] / [`KmsError::EmptyKeyId`] before any I/O.
    /// - [`KmsError::Kek`] if the KEK cannot be resolved or the wrapped DEK
    ///   does not open.
    /// - [`KmsError::Storage`] if persisting a new DEK fails; the generated key
    ///   is discarded.
    /// - [`KmsError::LengthMismatch`] if the stored DEK has another length.
    pub async fn get_dek(&self, kek_id: &str, key_id: &str, size: usize) -> Result<DataKey, KmsError> {
        if size == 0 || size > MAX_DEK_LEN {
            return Err(KmsError::InvalidLength(size));
        }
        if key_id.is_empty() {
            return Err(KmsError::EmptyKeyId);
        }

        let kek = self.kek_source.resolve(kek_id).await?;

        match self.store.get(key_id).await {
            Ok(wrapped) => {
                debug!(key_id, "unwrapping stored DEK");
                return open(kek.as_ref(), key_id, &wrapped, size).await;
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let dek = random_bytes(size);
        let wrapped = kek.wrap_key(key_id, &dek).await?;
        match self.store.put_if_absent(key_id, &wrapped).await {
            Ok(()) => {
                info!(key_id, kek_id, "generated new DEK");
                Ok(dek)
            }
            Err(StorageError::AlreadyExists(_)) => {
                debug!(key_id, "lost DEK creation race, using stored key");
                let wrapped = self.store.get(key_id).await?;
                open(kek.as_ref(), key_id, &wrapped, size).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn open(kek: &dyn Kek, key_id: &str, wrapped: &[u8], size: usize) -> Result<DataKey, KmsError> {
    let dek = kek.unwrap_key(key_id, wrapped).await?;
    if dek.len() != size {
        return Err(KmsError::LengthMismatch {
            key_id: key_id.to_owned(),
            stored: dek.len(),
            requested: size,
        });
    }
    Ok(dek)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        ClusterKekSource, KekError, MemoryStore, MockKekSource, MockWrappedKeyStore,
    };

    const KEK_ID: &str = "cluster-kek";

    fn coordinator() -> KmsCoordinator {
        let source = ClusterKekSource::new(&[3u8; 32]).unwrap();
        KmsCoordinator::new(Arc::new(source), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn same_key_id_yields_same_dek() {
        let kms = coordinator();
        let first = kms.get_dek(KEK_ID, "uuid-A", 64).await.unwrap();
        let second = kms.get_dek(KEK_ID, "uuid-A", 64).await.unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn different_key_ids_yield_different_deks() {
        let kms = coordinator();
        let a = kms.get_dek(KEK_ID, "uuid-A", 32).await.unwrap();
        let b = kms.get_dek(KEK_ID, "uuid-B", 32).await.unwrap();
        assert_ne!(*a, *b);
    }

    #[tokio::test]
    async fn concurrent_first_use_agrees_on_one_dek() {
        let kms = coordinator();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let kms = kms.clone();
                tokio::spawn(async move { kms.get_dek(KEK_ID, "uuid-race", 64).await.unwrap() })
            })
            .collect();

        let mut keys = Vec::new();
        for h in handles {
            keys.push(h.await.unwrap());
        }
        assert!(keys.windows(2).all(|w| *w[0] == *w[1]));
    }

    #[tokio::test]
    async fn invalid_requests_rejected_before_io() {
        let mut source = MockKekSource::new();
        source.expect_resolve().never();
        let kms = KmsCoordinator::new(Arc::new(source), Arc::new(MemoryStore::new()));

        assert!(matches!(
            kms.get_dek(KEK_ID, "uuid-A", 0).await,
            Err(KmsError::InvalidLength(0))
        ));
        assert!(matches!(
            kms.get_dek(KEK_ID, "uuid-A", MAX_DEK_LEN + 1).await,
            Err(KmsError::InvalidLength(_))
        ));
        assert!(matches!(
            kms.get_dek(KEK_ID, "", 32).await,
            Err(KmsError::EmptyKeyId)
        ));
    }

    #[tokio::test]
    async fn missing_kek_is_a_hard_failure() {
        let mut source = MockKekSource::new();
        source
            .expect_resolve()
            .returning(|id| Err(KekError::NotFound(id.to_owned())));
        let mut store = MockWrappedKeyStore::new();
        store.expect_get().never();
        store.expect_put_if_absent().never();
        let kms = KmsCoordinator::new(Arc::new(source), Arc::new(store));

        assert!(matches!(
            kms.get_dek(KEK_ID, "uuid-A", 32).await,
            Err(KmsError::Kek(KekError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn failed_persist_never_returns_the_generated_key() {
        let mut store = MockWrappedKeyStore::new();
        store
            .expect_get()
            .returning(|id| Err(StorageError::NotFound(id.to_owned())));
        store
            .expect_put_if_absent()
            .returning(|_, _| Err(StorageError::Backend("bucket unreachable".into())));
        let source = ClusterKekSource::new(&[3u8; 32]).unwrap();
        let kms = KmsCoordinator::new(Arc::new(source), Arc::new(store));

        assert!(matches!(
            kms.get_dek(KEK_ID, "uuid-A", 32).await,
            Err(KmsError::Storage(StorageError::Backend(_)))
        ));
    }

    #[tokio::test]
    async fn race_loser_returns_the_stored_key() {
        // Simulate another writer persisting between our get and put.
        let source = Arc::new(ClusterKekSource::new(&[3u8; 32]).unwrap());
        let winner_dek = vec![0x5Au8; 32];
        let winner_wrapped = source
            .resolve(KEK_ID)
            .await
            .unwrap()
            .wrap_key("uuid-A", &winner_dek)
            .await
            .unwrap();

        let mut store = MockWrappedKeyStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Err(StorageError::NotFound(id.to_owned())));
        store
            .expect_put_if_absent()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id, _| Err(StorageError::AlreadyExists(id.to_owned())));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(winner_wrapped.clone()));

        let kms = KmsCoordinator::new(source, Arc::new(store));
        let dek = kms.get_dek(KEK_ID, "uuid-A", 32).await.unwrap();
        assert_eq!(*dek, winner_dek);
    }

    #[tokio::test]
    async fn stored_length_must_match_request() {
        let kms = coordinator();
        kms.get_dek(KEK_ID, "uuid-A", 32).await.unwrap();
        assert!(matches!(
            kms.get_dek(KEK_ID, "uuid-A", 64).await,
            Err(KmsError::LengthMismatch { stored: 32, requested: 64, .. })
        ));
    }
}
