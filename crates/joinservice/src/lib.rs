//! Join service: runs on every control-plane node and hands joining nodes
//! everything they need to become cluster members.

pub mod ca;
pub mod config;
pub mod identity;
pub mod issuer;
pub mod keypush;
pub mod kms_client;
pub mod kubeadm;
pub mod server;

pub use issuer::{IssueError, JoinTicketIssuer};
