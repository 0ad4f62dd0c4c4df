//! Key management for node state disks.
//!
//! [`KmsCoordinator::get_dek`] returns a stable per-key-ID DEK, generating and
//! persisting it on first use. KEKs and wrapped DEKs live behind pluggable
//! [`backend`]s chosen from configuration URIs ([`setup`]).
//!
//! # Security invariants
//!
//! - Plaintext DEKs and KEKs are never written to disk, logged, or included in traces.
//! - Key buffers are zeroed on drop.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod server;
pub mod setup;

pub use coordinator::{DataKey, KmsCoordinator, MAX_DEK_LEN};
pub use error::KmsError;
