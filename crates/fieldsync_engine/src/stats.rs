//! Counters describing sync activity.

use parking_lot::RwLock;
use std::sync::Arc;

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Drain passes that ran.
    pub drain_passes: u64,
    /// Operations written to the remote store.
    pub operations_pushed: u64,
    /// Failed apply attempts that were rescheduled.
    pub operations_failed: u64,
    /// Operations parked after failing validation.
    pub operations_parked: u64,
    /// Apply attempts of operations that had failed before.
    pub retries: u64,
    /// Remote records written locally.
    pub remote_merged: u64,
    /// Remote records dropped as malformed.
    pub remote_skipped: u64,
    /// Remote records older than the local copy.
    pub remote_stale: u64,
}

/// Stats shared between the scheduler and the change listeners.
pub(crate) type SharedStats = Arc<RwLock<SyncStats>>;
