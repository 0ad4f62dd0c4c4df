//! Middleware settings applied to the router.

use std::time::Duration;

/// Default per-request timeout applied to all routes. Covers a remote KEK
/// round trip plus a conditional storage write.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
