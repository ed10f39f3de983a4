//! Configuration recognized by the tablet peer core.
//!
//! Knobs are passed explicitly into [`crate::facade::TabletPeer::init`]
//! rather than read from process-wide globals, so multiple peers in the
//! same process can run with independent GC cadence and pool sizing.

use serde::{Deserialize, Serialize};

/// Tunables for one tablet peer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletPeerConfig {
    /// When `false`, the log-GC worker logs once and exits immediately
    /// without deleting anything.
    pub enable_log_gc: bool,

    /// Inter-iteration delay for the log-GC loop, in milliseconds.
    pub log_gc_sleep_delay_ms: u64,

    /// Worker count for the leader-apply executor pool.
    pub leader_apply_threads: usize,

    /// Worker count for the replica-apply executor pool.
    pub replica_apply_threads: usize,

    /// Bounded queue capacity for each executor pool.
    pub executor_queue_capacity: usize,

    /// Maximum number of trace entries retained per driver before the
    /// oldest are evicted.
    pub max_trace_entries: usize,
}

impl Default for TabletPeerConfig {
    fn default() -> Self {
        Self {
            enable_log_gc: true,
            log_gc_sleep_delay_ms: 10_000,
            leader_apply_threads: 4,
            replica_apply_threads: 4,
            executor_queue_capacity: 256,
            max_trace_entries: 64,
        }
    }
}
