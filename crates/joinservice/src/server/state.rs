//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::issuer::JoinTicketIssuer;
use crate::keypush::KeyPusher;
use crate::kms_client::DataKeyGetter;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub issuer: JoinTicketIssuer,
    /// Used directly by the key release trigger, outside ticket issuance.
    pub kms: Arc<dyn DataKeyGetter>,
    pub key_pusher: Arc<dyn KeyPusher>,
}

impl AppState {
    pub fn new(
        issuer: JoinTicketIssuer,
        kms: Arc<dyn DataKeyGetter>,
        key_pusher: Arc<dyn KeyPusher>,
    ) -> Self {
        Self {
            issuer,
            kms,
            key_pusher,
        }
    }
}
