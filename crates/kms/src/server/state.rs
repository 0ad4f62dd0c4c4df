//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::backend::{ClusterKekSource, MemoryStore};
use crate::KmsCoordinator;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: KmsCoordinator,
    /// KEK every data key handed out by this service is wrapped under.
    pub kek_id: Arc<String>,
}

impl AppState {
    pub fn new(coordinator: KmsCoordinator, kek_id: String) -> Self {
        Self {
            coordinator,
            kek_id: Arc::new(kek_id),
        }
    }
}

impl Default for AppState {
    /// In-memory custody under a fixed master secret, suitable for tests.
    fn default() -> Self {
        let source = ClusterKekSource::from_array([0x42; 32]);
        let coordinator = KmsCoordinator::new(Arc::new(source), Arc::new(MemoryStore::new()));
        Self::new(coordinator, "cluster-kek".into())
    }
}
