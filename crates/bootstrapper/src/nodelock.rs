//! Process-wide single-use gate guarding the join RPC phase.

use std::sync::atomic::{AtomicBool, Ordering};

/// Unlocked until the first successful [`NodeLock::try_lock_once`]; locked for
/// the rest of the process lifetime.
#[derive(Debug, Default)]
pub struct NodeLock {
    locked: AtomicBool,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for exactly one caller across the process lifetime.
    pub fn try_lock_once(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}
