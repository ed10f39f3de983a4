//! Transaction drivers: the per-operation state machines that carry a
//! write, schema change, or config change through Prepare, Replicate,
//! Apply, and Commit.
//!
//! A leader driver originates an operation locally and drives it through
//! all four phases. A replica driver is handed an already-in-flight round
//! by the consensus collaborator and only needs to Prepare, wait for the
//! commit notification, and Apply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
#[cfg(test)]
use std::time::Duration;

use tablet_peer_types::OpId;

use crate::collaborators::{CommitContinuation, Log, LogRecord, LogRecordKind, OperationState, Storage};
use crate::error::{TabletError, TabletResult};
use crate::executor::{oneshot, OneshotReceiver, OneshotSender, PrepareReplicateLatch, WorkerPool};
use crate::lifecycle::LifecycleController;

/// The phase a driver is currently in or has most recently completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Prepare,
    Replicate,
    Apply,
    Commit,
    Failed,
}

impl DriverPhase {
    pub fn name(self) -> &'static str {
        match self {
            DriverPhase::Prepare => "PREPARE",
            DriverPhase::Replicate => "REPLICATE",
            DriverPhase::Apply => "APPLY",
            DriverPhase::Commit => "COMMIT",
            DriverPhase::Failed => "FAILED",
        }
    }
}

/// A ring buffer of phase transitions, capped so a long-lived driver (or a
/// hung one) can't grow its trace without bound.
pub struct DriverTrace {
    entries: Mutex<Vec<String>>,
    capacity: usize,
}

impl DriverTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, message: impl Into<String>) {
        let mut entries = self.entries.lock().expect("trace mutex poisoned");
        if entries.len() >= self.capacity {
            entries.remove(0);
        }
        entries.push(message.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().expect("trace mutex poisoned").clone()
    }
}

/// The shared handle between a driver and the consensus collaborator for one
/// replication round.
///
/// Consensus assigns the OpId and, once quorum is reached, fires the
/// completion channel; a driver blocks on [`ConsensusRound::wait_replicated`]
/// between its Replicate and Apply phases. The driver holds this behind an
/// `Arc` so consensus can retain a reference independently of the driver's
/// own lifetime, and a replica round additionally carries a
/// [`CommitContinuation`] so consensus can invoke the driver's Apply phase
/// when the commit message for this round arrives.
pub struct ConsensusRound {
    operation: OperationState,
    assigned_op_id: Mutex<Option<OpId>>,
    completion: Mutex<Option<OneshotSender<TabletResult<OpId>>>>,
    continuation: Option<Arc<dyn CommitContinuation>>,
}

impl ConsensusRound {
    fn new(operation: OperationState) -> (Arc<Self>, OneshotReceiver<TabletResult<OpId>>) {
        let (tx, rx) = oneshot();
        let round = Arc::new(Self {
            operation,
            assigned_op_id: Mutex::new(None),
            completion: Mutex::new(Some(tx)),
            continuation: None,
        });
        (round, rx)
    }

    /// Builds a round for a replica driver, installing the continuation
    /// consensus will invoke once the commit message for this round arrives.
    pub fn for_replica(
        operation: OperationState,
        continuation: Arc<dyn CommitContinuation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            operation,
            assigned_op_id: Mutex::new(None),
            completion: Mutex::new(None),
            continuation: Some(continuation),
        })
    }

    pub fn operation(&self) -> &OperationState {
        &self.operation
    }

    pub fn assigned_op_id(&self) -> Option<OpId> {
        *self.assigned_op_id.lock().expect("round mutex poisoned")
    }

    /// Called by the consensus collaborator once it has assigned an OpId and
    /// (for a leader round) reached quorum.
    pub fn mark_replicated(&self, result: TabletResult<OpId>) {
        if let Ok(op_id) = &result {
            *self.assigned_op_id.lock().expect("round mutex poisoned") = Some(*op_id);
        }
        if let Some(sender) = self
            .completion
            .lock()
            .expect("round mutex poisoned")
            .take()
        {
            sender.send(result);
        }
    }

    /// Called by the consensus collaborator when the commit message for a
    /// replica round arrives, invoking the installed continuation.
    pub fn notify_committed(&self, op_id: OpId) -> TabletResult<()> {
        match &self.continuation {
            Some(continuation) => continuation.on_commit(op_id),
            None => Err(TabletError::InvalidArgument(
                "consensus round has no commit continuation".to_string(),
            )),
        }
    }
}

/// Counting semaphore of one: serializes configuration-change operations so
/// at most one is in flight at a time, across the whole peer.
#[derive(Default)]
pub struct ConfigChangeSemaphore(Mutex<()>);

impl ConfigChangeSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` while holding the semaphore for the duration of an entire
    /// config-change driver's lifetime (Prepare through Commit).
    pub fn with_permit<T>(&self, body: impl FnOnce() -> T) -> T {
        let _guard = self.0.lock().expect("config semaphore poisoned");
        body()
    }
}

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, process-local identifier for one driver instance, used for
/// tracking and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverId(pub u64);

impl DriverId {
    fn next() -> Self {
        Self(NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Collaborators and pools a driver needs to run an operation end to end.
pub struct DriverContext {
    pub storage: Arc<dyn Storage>,
    pub log: Arc<dyn Log>,
    pub lifecycle: Arc<LifecycleController>,
    pub prepare_pool: Arc<WorkerPool>,
    pub apply_pool: Arc<WorkerPool>,
    pub prepare_replicate_latch: Arc<PrepareReplicateLatch>,
    pub trace_capacity: usize,
}

/// Drives one leader-originated operation through Prepare, Replicate, Apply,
/// and Commit.
///
/// Prepare always runs on the (single-threaded) prepare pool, which is what
/// gives Prepare entry a total order across concurrent leader operations.
/// The prepare/replicate latch extends that ordering guarantee across the
/// hand-off into consensus. Apply then runs on the leader-apply pool, and
/// Commit is simply "the write is now visible and the submitter is
/// released" — represented here by the Apply phase's completion.
pub struct LeaderDriver {
    id: DriverId,
    context: Arc<DriverContext>,
    trace: Arc<DriverTrace>,
    phase: Mutex<DriverPhase>,
    assigned_op_id: Mutex<Option<OpId>>,
}

impl LeaderDriver {
    pub fn new(context: Arc<DriverContext>) -> Arc<Self> {
        let trace = Arc::new(DriverTrace::new(context.trace_capacity));
        Arc::new(Self {
            id: DriverId::next(),
            context,
            trace,
            phase: Mutex::new(DriverPhase::Prepare),
            assigned_op_id: Mutex::new(None),
        })
    }

    pub fn id(&self) -> DriverId {
        self.id
    }

    pub fn phase(&self) -> DriverPhase {
        *self.phase.lock().expect("phase mutex poisoned")
    }

    pub fn assigned_op_id(&self) -> Option<OpId> {
        *self.assigned_op_id.lock().expect("op id mutex poisoned")
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.snapshot()
    }

    fn set_phase(&self, phase: DriverPhase) {
        *self.phase.lock().expect("phase mutex poisoned") = phase;
        self.trace.record(format!("entered {}", phase.name()));
    }

    /// Runs the operation end to end, blocking the calling thread until it
    /// commits or definitively fails. Prepare is offloaded to the prepare
    /// pool; the calling thread blocks on the round's completion channel
    /// between Replicate and Apply.
    pub fn run(
        self: Arc<Self>,
        operation: OperationState,
        consensus: Arc<dyn crate::collaborators::Consensus>,
    ) -> TabletResult<OpId> {
        let driver = Arc::clone(&self);
        let (prepare_tx, prepare_rx) = oneshot::<TabletResult<()>>();
        self.context
            .prepare_pool
            .submit(move || {
                driver.set_phase(DriverPhase::Prepare);
                // Validation belongs to the storage collaborator in a full
                // implementation; this core only sequences the phases.
                prepare_tx.send(Ok(()));
            })
            .map_err(|()| TabletError::service_unavailable("SHUTTING_DOWN"))?;

        prepare_rx
            .recv()
            .ok_or_else(|| TabletError::Aborted("prepare pool shut down before completion".into()))??;

        let (round, completion_rx) = ConsensusRound::new(operation);
        self.set_phase(DriverPhase::Replicate);
        self.context
            .prepare_replicate_latch
            .with_latch(|| consensus.replicate(Arc::clone(&round)))?;

        let op_id = completion_rx
            .recv()
            .ok_or_else(|| TabletError::Aborted("consensus shut down before replicating".into()))??;
        *self.assigned_op_id.lock().expect("op id mutex poisoned") = Some(op_id);
        self.context.log.append(LogRecord {
            op_id,
            kind: LogRecordKind::Replicate,
            payload: round.operation().payload.clone(),
        })?;

        let driver = Arc::clone(&self);
        let context = Arc::clone(&self.context);
        let (apply_tx, apply_rx) = oneshot::<TabletResult<()>>();
        let apply_pool = Arc::clone(&context.apply_pool);
        apply_pool
            .submit(move || {
                driver.set_phase(DriverPhase::Apply);
                let result = context.storage.apply(round.operation()).and_then(|()| {
                    context.log.append(LogRecord {
                        op_id,
                        kind: LogRecordKind::Commit,
                        payload: Vec::new(),
                    })
                });
                if result.is_ok() {
                    driver.set_phase(DriverPhase::Commit);
                } else {
                    driver.set_phase(DriverPhase::Failed);
                    tracing::error!(driver_id = driver.id.0, trace = ?driver.trace(), "apply failed, quiescing tablet");
                    context.lifecycle.begin_shutdown();
                }
                apply_tx.send(result);
            })
            .map_err(|()| TabletError::service_unavailable("SHUTTING_DOWN"))?;

        apply_rx
            .recv()
            .ok_or_else(|| TabletError::Aborted("apply pool shut down before completion".into()))??;
        Ok(op_id)
    }
}

/// Drives one replica-side round: Prepare runs in the order consensus hands
/// rounds to this driver, then Apply runs once the commit message arrives
/// and invokes this driver's [`CommitContinuation`].
pub struct ReplicaDriver {
    id: DriverId,
    context: Arc<DriverContext>,
    trace: Arc<DriverTrace>,
    phase: Mutex<DriverPhase>,
    ack: Mutex<Option<OneshotSender<TabletResult<OpId>>>>,
    operation: OperationState,
    self_handle: Mutex<Option<Weak<Self>>>,
}

impl ReplicaDriver {
    pub fn new(
        context: Arc<DriverContext>,
        operation: OperationState,
    ) -> (Arc<Self>, OneshotReceiver<TabletResult<OpId>>) {
        let (tx, rx) = oneshot();
        let trace = Arc::new(DriverTrace::new(context.trace_capacity));
        let driver = Arc::new(Self {
            id: DriverId::next(),
            context,
            trace,
            phase: Mutex::new(DriverPhase::Prepare),
            ack: Mutex::new(Some(tx)),
            operation,
            self_handle: Mutex::new(None),
        });
        *driver.self_handle.lock().expect("self handle mutex poisoned") = Some(Arc::downgrade(&driver));
        (driver, rx)
    }

    pub fn id(&self) -> DriverId {
        self.id
    }

    pub fn phase(&self) -> DriverPhase {
        *self.phase.lock().expect("phase mutex poisoned")
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.snapshot()
    }

    fn set_phase(&self, phase: DriverPhase) {
        *self.phase.lock().expect("phase mutex poisoned") = phase;
        self.trace.record(format!("entered {}", phase.name()));
    }

    /// Prepares this round synchronously on the prepare pool, then returns
    /// immediately; Apply runs later, driven by this driver's
    /// [`CommitContinuation`] implementation. Takes `Arc<Self>` by value so
    /// the pool job can hold a `'static` handle back to the driver; clone
    /// the `Arc` first if the caller still needs it afterward.
    pub fn prepare(self: Arc<Self>) -> TabletResult<()> {
        let pool = Arc::clone(&self.context.prepare_pool);
        let driver = self;
        let (tx, rx) = oneshot::<TabletResult<()>>();
        pool.submit(move || {
            driver.set_phase(DriverPhase::Prepare);
            tx.send(Ok(()));
        })
        .map_err(|()| TabletError::service_unavailable("SHUTTING_DOWN"))?;
        rx.recv()
            .ok_or_else(|| TabletError::Aborted("prepare pool shut down before completion".into()))??;
        Ok(())
    }
}

impl CommitContinuation for ReplicaDriver {
    fn on_commit(&self, op_id: OpId) -> TabletResult<()> {
        // Installed on the round before replicate() is called; invoked from
        // whatever thread consensus uses to deliver the commit message, so
        // Apply is submitted to the replica-apply pool rather than run
        // inline on that thread.
        let driver = self
            .self_handle
            .lock()
            .expect("self handle mutex poisoned")
            .clone()
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| TabletError::Aborted("replica driver no longer alive".into()))?;
        let context = Arc::clone(&driver.context);
        let apply_pool = Arc::clone(&context.apply_pool);
        apply_pool
            .submit(move || {
                driver.set_phase(DriverPhase::Apply);
                let result = context
                    .log
                    .append(LogRecord {
                        op_id,
                        kind: LogRecordKind::Replicate,
                        payload: driver.operation.payload.clone(),
                    })
                    .and_then(|()| context.storage.apply(&driver.operation))
                    .and_then(|()| {
                        context.log.append(LogRecord {
                            op_id,
                            kind: LogRecordKind::Commit,
                            payload: Vec::new(),
                        })
                    });
                if result.is_ok() {
                    driver.set_phase(DriverPhase::Commit);
                } else {
                    driver.set_phase(DriverPhase::Failed);
                    tracing::error!(driver_id = driver.id.0, trace = ?driver.trace(), "replica apply failed, quiescing tablet");
                    context.lifecycle.begin_shutdown();
                }
                if let Some(ack) = driver.ack.lock().expect("ack mutex poisoned").take() {
                    ack.send(result.map(|()| op_id));
                }
            })
            .map_err(|()| TabletError::service_unavailable("SHUTTING_DOWN"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AnchorRegistry, MvccManager, OperationKind, StorageMetrics};
    use crate::testkit::local::{LocalConsensus, NullMvcc, NullRegistry};
    use crate::testkit::InMemoryLog;
    use std::sync::atomic::AtomicU64 as AU64;

    struct RecordingStorage {
        applied: AU64,
    }

    impl RecordingStorage {
        fn new() -> Self {
            Self { applied: AU64::new(0) }
        }
    }

    impl Storage for RecordingStorage {
        fn apply(&self, _state: &OperationState) -> TabletResult<()> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn metrics(&self) -> StorageMetrics {
            StorageMetrics {
                applied_operations: self.applied.load(Ordering::SeqCst),
                apply_failures: 0,
            }
        }
        fn mvcc_manager(&self) -> &dyn MvccManager {
            static MVCC: NullMvcc = NullMvcc::new();
            &MVCC
        }
        fn opid_anchor_registry(&self) -> &dyn AnchorRegistry {
            static REGISTRY: NullRegistry = NullRegistry::new();
            &REGISTRY
        }
        fn estimate_on_disk_size(&self) -> u64 {
            0
        }
        fn unregister_maintenance_ops(&self) {}
    }

    fn context() -> Arc<DriverContext> {
        Arc::new(DriverContext {
            storage: Arc::new(RecordingStorage::new()),
            log: Arc::new(InMemoryLog::new()),
            lifecycle: Arc::new(LifecycleController::new()),
            prepare_pool: Arc::new(WorkerPool::new("test-prepare", 1, 8)),
            apply_pool: Arc::new(WorkerPool::new("test-apply", 2, 8)),
            prepare_replicate_latch: Arc::new(PrepareReplicateLatch::new()),
            trace_capacity: 8,
        })
    }

    #[test]
    fn leader_driver_runs_all_phases_and_returns_assigned_op_id() {
        let ctx = context();
        let driver = LeaderDriver::new(ctx);
        let consensus: Arc<dyn crate::collaborators::Consensus> = Arc::new(LocalConsensus::new());
        consensus.start(Default::default(), Default::default()).unwrap();

        let op = OperationState::new(OperationKind::Write, b"hello".to_vec());
        let op_id = Arc::clone(&driver).run(op, consensus).unwrap();
        assert_eq!(op_id, OpId::new(1, 1));
        assert_eq!(driver.phase(), DriverPhase::Commit);
        assert_eq!(driver.assigned_op_id(), Some(op_id));
    }

    #[test]
    fn replica_round_notifies_installed_continuation() {
        let ctx = context();
        let operation = OperationState::new(OperationKind::Write, b"replicated".to_vec());
        let (driver, ack_rx) = ReplicaDriver::new(ctx, operation.clone());
        Arc::clone(&driver).prepare().unwrap();

        let continuation: Arc<dyn CommitContinuation> = driver;
        let round = ConsensusRound::for_replica(operation, continuation);
        round.notify_committed(OpId::new(2, 3)).unwrap();
        let acked = ack_rx.recv().expect("continuation should have acked").unwrap();
        assert_eq!(acked, OpId::new(2, 3));
    }

    #[test]
    fn notify_committed_without_continuation_is_an_error() {
        let (round, _rx) = ConsensusRound::new(OperationState::new(OperationKind::Write, Vec::new()));
        assert!(round.notify_committed(OpId::new(1, 1)).is_err());
    }

    #[test]
    fn trace_is_capped_at_capacity() {
        let trace = DriverTrace::new(2);
        trace.record("a");
        trace.record("b");
        trace.record("c");
        assert_eq!(trace.snapshot(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn config_semaphore_serializes_access() {
        let semaphore = Arc::new(ConfigChangeSemaphore::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&semaphore);
        let o1 = Arc::clone(&order);
        let t1 = std::thread::spawn(move || {
            s1.with_permit(|| {
                o1.lock().unwrap().push("enter-1");
                std::thread::sleep(Duration::from_millis(20));
                o1.lock().unwrap().push("exit-1");
            });
        });
        std::thread::sleep(Duration::from_millis(5));
        semaphore.with_permit(|| order.lock().unwrap().push("enter-2"));
        t1.join().unwrap();

        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded.last(), Some(&"enter-2"));
    }
}
