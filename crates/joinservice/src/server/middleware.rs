//! Middleware settings applied to the router.

use std::time::Duration;

/// Default per-request timeout applied to all routes. Ticket issuance waits on
/// the KMS, `kubeadm` and the CA in sequence.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
