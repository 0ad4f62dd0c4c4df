//! Common types, protocol definitions, and plumbing shared by the node
//! bootstrap crates: the KMS, the join service and the bootstrapper.

pub mod error;
pub mod metadata;
pub mod protocol;
pub mod serve;
pub mod telemetry;
pub mod tls;

pub use error::ServiceError;
pub use metadata::{InstanceMetadata, Role};

/// Length in bytes of a state-disk key handed out by the join service.
pub const STATE_DISK_KEY_LENGTH: usize = 64;

/// Port the join service listens on, on every control-plane node.
pub const JOIN_SERVICE_PORT: u16 = 30090;

/// Port a restarting node listens on for a pushed state-disk key.
pub const KEY_RELEASE_PORT: u16 = 9000;
