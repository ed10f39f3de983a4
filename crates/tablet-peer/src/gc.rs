//! Background log garbage collection.
//!
//! The worker repeatedly computes the earliest OpId still needed by
//! anything — the log's own last entry (so GC never deletes unflushed
//! state), any scanner-held anchor, and any operation still pending in the
//! transaction tracker — and asks the log collaborator to reclaim
//! everything strictly below it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tablet_peer_types::OpId;

use crate::collaborators::{Log, Storage};
use crate::executor::ShutdownLatch;
use crate::tracker::TransactionTracker;

/// Computes the lowest OpId that must survive garbage collection right now,
/// or `None` if the log is empty and there is nothing to collect.
pub fn earliest_needed_op_id(log: &dyn Log, storage: &dyn Storage, tracker: &TransactionTracker) -> Option<OpId> {
    let mut floor = log.get_last_entry_op_id()?;

    if let Some(anchor) = storage.opid_anchor_registry().earliest() {
        floor = floor.min(anchor);
    }
    if let Some(pending) = tracker.earliest_pending_op_id() {
        floor = floor.min(pending);
    }

    Some(floor)
}

/// Owns the background thread that periodically runs log GC.
///
/// When GC is disabled, the worker logs once and exits immediately rather
/// than spinning a thread that only ever sleeps.
pub struct LogGcWorker {
    latch: Arc<ShutdownLatch>,
    handle: Option<JoinHandle<()>>,
}

impl LogGcWorker {
    /// Spawns the worker thread (unless `enabled` is `false`, in which case
    /// the worker records its disabled status and returns immediately).
    pub fn spawn(
        enabled: bool,
        sleep_delay: Duration,
        log: Arc<dyn Log>,
        storage: Arc<dyn Storage>,
        tracker: Arc<TransactionTracker>,
    ) -> Self {
        let latch = Arc::new(ShutdownLatch::new());

        if !enabled {
            tracing::info!("log gc disabled, worker will not run");
            return Self { latch, handle: None };
        }

        let worker_latch = Arc::clone(&latch);
        let handle = thread::Builder::new()
            .name("log-gc".to_string())
            .spawn(move || Self::run(&worker_latch, sleep_delay, &*log, &*storage, &tracker))
            .expect("failed to spawn log-gc thread");

        Self {
            latch,
            handle: Some(handle),
        }
    }

    fn run(
        latch: &ShutdownLatch,
        sleep_delay: Duration,
        log: &dyn Log,
        storage: &dyn Storage,
        tracker: &TransactionTracker,
    ) {
        tracing::info!("log gc worker started");
        loop {
            if latch.is_tripped() {
                break;
            }

            match earliest_needed_op_id(log, storage, tracker) {
                Some(min_op_id) => match log.gc(min_op_id) {
                    Ok(reclaimed) if reclaimed > 0 => {
                        tracing::debug!(%min_op_id, reclaimed, "log gc reclaimed segments");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        // Non-fatal: log and retry on the next tick.
                        tracing::warn!(%error, "log gc iteration failed, will retry");
                    }
                },
                None => {}
            }

            if latch.sleep(sleep_delay) {
                break;
            }
        }
        tracing::info!("log gc worker stopped");
    }

    /// Signals the worker to stop and blocks until its thread exits. A
    /// disabled worker returns immediately.
    pub fn shutdown(mut self) {
        self.latch.trip();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
