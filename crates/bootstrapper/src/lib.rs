//! Node bootstrapper: brings a node's state disk online and joins it to the
//! cluster.
//!
//! A node whose state disk already carries a crypt header is restarting and
//! waits for a control plane to push its disk key. Any other node runs the
//! join client, which fetches a join ticket and formats the disk with the
//! ticket's key.

pub mod config;
pub mod cryptmapper;
pub mod joinclient;
pub mod keyservice;
pub mod kubernetes;
pub mod metadata;
pub mod nodelock;
pub mod statedisk;

pub use joinclient::{JoinClient, JoinError};
pub use keyservice::{KeyReleaseWaiter, PushError};
pub use nodelock::NodeLock;
