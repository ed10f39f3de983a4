//! The registry of in-flight operations.
//!
//! Every driver registers itself here the moment it's created and removes
//! itself the moment it finishes (committed or failed). The log-GC worker
//! reads the registry to find the oldest OpId still owned by a pending
//! driver, and shutdown blocks on it draining to empty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use tablet_peer_types::OpId;

use crate::collaborators::OperationKind;
use crate::driver::DriverId;

/// A lightweight view of one in-flight operation, enough for `get_status`
/// and for the GC worker's earliest-needed-OpId scan.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: DriverId,
    pub kind: OperationKind,
    /// `None` until the operation has been assigned an OpId by consensus.
    pub op_id: Option<OpId>,
}

/// Per-kind counters, incremented as operations are added and removed.
#[derive(Default)]
pub struct TrackerMetrics {
    writes_started: AtomicU64,
    writes_finished: AtomicU64,
    alter_schema_started: AtomicU64,
    alter_schema_finished: AtomicU64,
    change_config_started: AtomicU64,
    change_config_finished: AtomicU64,
}

impl TrackerMetrics {
    fn on_add(&self, kind: OperationKind) {
        let counter = match kind {
            OperationKind::Write => &self.writes_started,
            OperationKind::AlterSchema => &self.alter_schema_started,
            OperationKind::ChangeConfig => &self.change_config_started,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_remove(&self, kind: OperationKind) {
        let counter = match kind {
            OperationKind::Write => &self.writes_finished,
            OperationKind::AlterSchema => &self.alter_schema_finished,
            OperationKind::ChangeConfig => &self.change_config_finished,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::Write => self.writes_started.load(Ordering::Relaxed),
            OperationKind::AlterSchema => self.alter_schema_started.load(Ordering::Relaxed),
            OperationKind::ChangeConfig => self.change_config_started.load(Ordering::Relaxed),
        }
    }

    pub fn finished(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::Write => self.writes_finished.load(Ordering::Relaxed),
            OperationKind::AlterSchema => self.alter_schema_finished.load(Ordering::Relaxed),
            OperationKind::ChangeConfig => self.change_config_finished.load(Ordering::Relaxed),
        }
    }
}

struct TrackerState {
    pending: HashMap<DriverId, PendingOperation>,
}

/// Thread-safe registry of pending operations, with a blocking drain wait
/// used during shutdown.
pub struct TransactionTracker {
    state: Mutex<TrackerState>,
    drained: Condvar,
    metrics: TrackerMetrics,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                pending: HashMap::new(),
            }),
            drained: Condvar::new(),
            metrics: TrackerMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &TrackerMetrics {
        &self.metrics
    }

    /// Registers a newly created driver. O(1).
    pub fn add(&self, id: DriverId, kind: OperationKind) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        state
            .pending
            .insert(id, PendingOperation { id, kind, op_id: None });
        self.metrics.on_add(kind);
    }

    /// Records the OpId consensus assigned to a pending driver, so the GC
    /// worker can see it without the driver exposing its internals.
    pub fn assign_op_id(&self, id: DriverId, op_id: OpId) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        if let Some(entry) = state.pending.get_mut(&id) {
            entry.op_id = Some(op_id);
        }
    }

    /// Removes a finished driver. O(1). Wakes any thread blocked in
    /// [`TransactionTracker::wait_for_drain`] if this was the last one.
    pub fn remove(&self, id: DriverId) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        if let Some(entry) = state.pending.remove(&id) {
            self.metrics.on_remove(entry.kind);
        }
        if state.pending.is_empty() {
            self.drained.notify_all();
        }
    }

    /// A point-in-time snapshot of every pending operation.
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.state
            .lock()
            .expect("tracker mutex poisoned")
            .pending
            .values()
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("tracker mutex poisoned").pending.len()
    }

    /// The lowest OpId owned by a currently pending driver, or `None` if
    /// nothing is pending or none has been assigned an OpId yet.
    pub fn earliest_pending_op_id(&self) -> Option<OpId> {
        self.state
            .lock()
            .expect("tracker mutex poisoned")
            .pending
            .values()
            .filter_map(|entry| entry.op_id)
            .min()
    }

    /// Blocks the calling thread until every registered driver has been
    /// removed.
    pub fn wait_for_drain(&self) {
        let state = self.state.lock().expect("tracker mutex poisoned");
        let _guard = self
            .drained
            .wait_while(state, |state| !state.pending.is_empty())
            .expect("tracker mutex poisoned");
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}
