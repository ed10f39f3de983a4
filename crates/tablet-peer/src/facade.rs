//! The public entry point: one [`TabletPeer`] per hosted tablet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tablet_peer_types::{OpId, PeerRole, QuorumConfig, ReplicaId, TabletId};

use crate::collaborators::{
    BootstrapInfo, CommitContinuation, Consensus, Log, MetadataStore, OperationKind,
    OperationState, Storage, TabletStatus,
};
use crate::config::TabletPeerConfig;
use crate::driver::{ConfigChangeSemaphore, ConsensusRound, DriverContext, LeaderDriver, ReplicaDriver};
use crate::error::{TabletError, TabletResult};
use crate::executor::{PrepareReplicateLatch, WorkerPool};
use crate::gc::LogGcWorker;
use crate::lifecycle::LifecycleController;
use crate::tracker::{PendingOperation, TransactionTracker};

/// Per-shard coordination core.
///
/// Owns the lifecycle state machine, the transaction tracker, the executor
/// pools, the log-GC worker, and a handle to each collaborator. Everything
/// a caller does — submitting an operation, reading status, shutting down —
/// goes through this type.
pub struct TabletPeer {
    local_replica_id: ReplicaId,
    lifecycle: Arc<LifecycleController>,
    tracker: Arc<TransactionTracker>,
    config: TabletPeerConfig,
    config_semaphore: ConfigChangeSemaphore,

    consensus: Arc<dyn Consensus>,
    log: Arc<dyn Log>,
    storage: Arc<dyn Storage>,
    metadata: Arc<dyn MetadataStore>,

    prepare_pool: Mutex<Option<Arc<WorkerPool>>>,
    leader_apply_pool: Mutex<Option<Arc<WorkerPool>>>,
    replica_apply_pool: Mutex<Option<Arc<WorkerPool>>>,
    prepare_replicate_latch: Arc<PrepareReplicateLatch>,
    gc_worker: Mutex<Option<LogGcWorker>>,

    role: Mutex<PeerRole>,
    shutting_down: AtomicBool,
}

impl TabletPeer {
    /// Constructs a peer in the `Bootstrapping` state. Nothing runs until
    /// [`TabletPeer::init`] and [`TabletPeer::start`] are called.
    pub fn new(
        local_replica_id: ReplicaId,
        config: TabletPeerConfig,
        consensus: Arc<dyn Consensus>,
        log: Arc<dyn Log>,
        storage: Arc<dyn Storage>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            local_replica_id,
            lifecycle: Arc::new(LifecycleController::new()),
            tracker: Arc::new(TransactionTracker::new()),
            config,
            config_semaphore: ConfigChangeSemaphore::new(),
            consensus,
            log,
            storage,
            metadata,
            prepare_pool: Mutex::new(None),
            leader_apply_pool: Mutex::new(None),
            replica_apply_pool: Mutex::new(None),
            prepare_replicate_latch: Arc::new(PrepareReplicateLatch::new()),
            gc_worker: Mutex::new(None),
            role: Mutex::new(PeerRole::NonParticipant),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// `Bootstrapping -> Configuring`: allocates the executor pools. Does
    /// not yet admit operations.
    pub fn init(&self) -> TabletResult<()> {
        self.lifecycle.init()?;
        *self.prepare_pool.lock().expect("pool mutex poisoned") =
            Some(Arc::new(WorkerPool::new("prepare", 1, self.config.executor_queue_capacity)));
        *self.leader_apply_pool.lock().expect("pool mutex poisoned") = Some(Arc::new(
            WorkerPool::new("leader-apply", self.config.leader_apply_threads, self.config.executor_queue_capacity),
        ));
        *self.replica_apply_pool.lock().expect("pool mutex poisoned") = Some(Arc::new(
            WorkerPool::new("replica-apply", self.config.replica_apply_threads, self.config.executor_queue_capacity),
        ));
        Ok(())
    }

    /// `Configuring -> Running`: starts consensus with the persisted
    /// quorum, starts the log-GC worker, and admits operations.
    pub fn start(&self, bootstrap_info: BootstrapInfo) -> TabletResult<()> {
        let quorum = self.config_semaphore.with_permit(|| -> TabletResult<QuorumConfig> {
            let initial_quorum = self.metadata.quorum();
            let quorum = self.consensus.start(initial_quorum, bootstrap_info)?;
            self.metadata.set_quorum(quorum.clone());
            Ok(quorum)
        })?;

        *self.role.lock().expect("role mutex poisoned") = quorum.role_of(self.local_replica_id);

        *self.gc_worker.lock().expect("gc worker mutex poisoned") = Some(LogGcWorker::spawn(
            self.config.enable_log_gc,
            Duration::from_millis(self.config.log_gc_sleep_delay_ms),
            Arc::clone(&self.log),
            Arc::clone(&self.storage),
            Arc::clone(&self.tracker),
        ));

        self.lifecycle.start()
    }

    fn driver_context(&self, apply_pool: Arc<WorkerPool>) -> TabletResult<Arc<DriverContext>> {
        let prepare_pool = self
            .prepare_pool
            .lock()
            .expect("pool mutex poisoned")
            .clone()
            .ok_or_else(|| TabletError::service_unavailable(self.lifecycle.current().name()))?;
        Ok(Arc::new(DriverContext {
            storage: Arc::clone(&self.storage),
            log: Arc::clone(&self.log),
            lifecycle: Arc::clone(&self.lifecycle),
            prepare_pool,
            apply_pool,
            prepare_replicate_latch: Arc::clone(&self.prepare_replicate_latch),
            trace_capacity: self.config.max_trace_entries,
        }))
    }

    fn submit_leader_operation(&self, kind: OperationKind, payload: Vec<u8>) -> TabletResult<OpId> {
        self.lifecycle.check_running()?;
        let apply_pool = self
            .leader_apply_pool
            .lock()
            .expect("pool mutex poisoned")
            .clone()
            .ok_or_else(|| TabletError::service_unavailable(self.lifecycle.current().name()))?;
        let context = self.driver_context(apply_pool)?;

        let driver = LeaderDriver::new(context);
        let driver_id = driver.id();
        self.tracker.add(driver_id, kind);
        let result = driver.run(OperationState::new(kind, payload), Arc::clone(&self.consensus));
        if let Ok(op_id) = result {
            self.tracker.assign_op_id(driver_id, op_id);
        }
        self.tracker.remove(driver_id);
        result
    }

    /// Submits a write through the leader driver. Requires the peer to be
    /// `Running`.
    pub fn submit_write(&self, payload: Vec<u8>) -> TabletResult<OpId> {
        self.submit_leader_operation(OperationKind::Write, payload)
    }

    /// Submits a schema change through the leader driver.
    pub fn submit_alter_schema(&self, payload: Vec<u8>) -> TabletResult<OpId> {
        self.submit_leader_operation(OperationKind::AlterSchema, payload)
    }

    /// Submits a configuration change. Holds the config-change semaphore for
    /// the operation's entire lifetime, so at most one configuration change
    /// is in flight across the whole peer at a time.
    pub fn submit_change_config(&self, new_quorum: QuorumConfig) -> TabletResult<OpId> {
        self.config_semaphore.with_permit(|| {
            let payload = serde_json::to_vec(&new_quorum)
                .map_err(|error| TabletError::InvalidArgument(error.to_string()))?;
            let op_id = self.submit_leader_operation(OperationKind::ChangeConfig, payload)?;
            self.metadata.set_quorum(new_quorum.clone());
            *self.role.lock().expect("role mutex poisoned") = new_quorum.role_of(self.local_replica_id);
            Ok(op_id)
        })
    }

    /// Accepts a round the consensus collaborator is driving on this
    /// replica: runs Prepare immediately and installs the driver as the
    /// round's commit continuation so consensus can invoke Apply later.
    pub fn start_replica_transaction(&self, operation: OperationState) -> TabletResult<Arc<ConsensusRound>> {
        self.lifecycle.check_running()?;
        let apply_pool = self
            .replica_apply_pool
            .lock()
            .expect("pool mutex poisoned")
            .clone()
            .ok_or_else(|| TabletError::service_unavailable(self.lifecycle.current().name()))?;
        let context = self.driver_context(apply_pool)?;

        let (driver, ack_rx) = ReplicaDriver::new(context, operation.clone());
        let driver_id = driver.id();
        self.tracker.add(driver_id, operation.kind);
        Arc::clone(&driver).prepare()?;

        let tracker = Arc::clone(&self.tracker);
        std::thread::Builder::new()
            .name(format!("replica-ack-{}", driver_id.0))
            .spawn(move || {
                if let Some(Ok(op_id)) = ack_rx.recv() {
                    tracker.assign_op_id(driver_id, op_id);
                }
                tracker.remove(driver_id);
            })
            .expect("failed to spawn replica ack thread");

        let continuation: Arc<dyn CommitContinuation> = driver;
        Ok(ConsensusRound::for_replica(operation, continuation))
    }

    /// Initiates shutdown in the exact order required to avoid use-after-free
    /// style races between the collaborators and the pools that call into
    /// them:
    ///
    /// 1. Mark the lifecycle `Quiescing` so no new operation is admitted.
    /// 2. Unregister maintenance hooks with the storage collaborator.
    /// 3. Trip the log-GC latch and await the worker's exit.
    /// 4. Stop accepting new consensus rounds.
    /// 5. Wait for the transaction tracker to drain.
    /// 6. Shut down the apply pools.
    /// 7. Shut down the prepare pool.
    /// 8. Flush metadata and close the log.
    /// 9. Mark the lifecycle `Shutdown`.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return; // already in progress or done
        }

        self.lifecycle.begin_shutdown();
        self.storage.unregister_maintenance_ops();

        if let Some(gc_worker) = self.gc_worker.lock().expect("gc worker mutex poisoned").take() {
            gc_worker.shutdown();
        }

        self.consensus.shutdown();
        self.tracker.wait_for_drain();

        if let Some(pool) = self.leader_apply_pool.lock().expect("pool mutex poisoned").take() {
            match Arc::try_unwrap(pool) {
                Ok(pool) => pool.shutdown(),
                Err(_) => tracing::warn!("leader-apply pool still referenced at shutdown, leaking its threads"),
            }
        }
        if let Some(pool) = self.replica_apply_pool.lock().expect("pool mutex poisoned").take() {
            match Arc::try_unwrap(pool) {
                Ok(pool) => pool.shutdown(),
                Err(_) => tracing::warn!("replica-apply pool still referenced at shutdown, leaking its threads"),
            }
        }
        if let Some(pool) = self.prepare_pool.lock().expect("pool mutex poisoned").take() {
            if let Ok(pool) = Arc::try_unwrap(pool) {
                pool.shutdown();
            }
        }

        let _ = self.metadata.flush();
        let _ = self.log.close();

        self.lifecycle.finish_shutdown();
    }

    pub fn get_status(&self) -> TabletStatus {
        TabletStatus {
            tablet_id: self.metadata.oid(),
            table_name: String::new(),
            last_status: self.lifecycle.current().name().to_string(),
            start_key: Vec::new(),
            end_key: Vec::new(),
            state_name: self.lifecycle.current().name(),
            estimated_on_disk_size: self.storage.estimate_on_disk_size(),
        }
    }

    pub fn get_in_flight(&self) -> Vec<PendingOperation> {
        self.tracker.pending()
    }

    pub fn role(&self) -> PeerRole {
        *self.role.lock().expect("role mutex poisoned")
    }

    pub fn get_safe_timestamp(&self) -> u64 {
        self.storage.mvcc_manager().safe_timestamp()
    }

    pub fn update_safe_timestamp(&self, timestamp: u64) {
        self.storage.mvcc_manager().update_safe_timestamp(timestamp);
    }

    pub fn tablet_id(&self) -> TabletId {
        self.metadata.oid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{InMemoryLog, InMemoryMetadataStore, InMemoryStorage, LocalConsensus};
    use tablet_peer_types::PeerEntry;

    fn single_replica_peer(replica: ReplicaId) -> TabletPeer {
        let quorum = QuorumConfig::single(replica, "127.0.0.1:7050");
        let metadata = Arc::new(InMemoryMetadataStore::new(TabletId::generate(), quorum));
        TabletPeer::new(
            replica,
            TabletPeerConfig {
                log_gc_sleep_delay_ms: 5,
                ..TabletPeerConfig::default()
            },
            Arc::new(LocalConsensus::new()),
            Arc::new(InMemoryLog::new()),
            Arc::new(InMemoryStorage::new()),
            metadata,
        )
    }

    #[test]
    fn single_replica_write_commits_and_reports_leader_role() {
        let replica = ReplicaId::generate();
        let peer = single_replica_peer(replica);
        peer.init().unwrap();
        peer.start(BootstrapInfo::default()).unwrap();

        assert_eq!(peer.role(), PeerRole::Leader);
        let op_id = peer.submit_write(b"row-1".to_vec()).unwrap();
        assert_eq!(op_id, OpId::new(1, 1));
        assert!(peer.get_in_flight().is_empty());

        peer.shutdown();
    }

    #[test]
    fn operations_before_start_are_rejected() {
        let replica = ReplicaId::generate();
        let peer = single_replica_peer(replica);
        peer.init().unwrap();
        let err = peer.submit_write(b"too-early".to_vec()).unwrap_err();
        match err {
            TabletError::ServiceUnavailable { state } => assert_eq!(state, "CONFIGURING"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let replica = ReplicaId::generate();
        let peer = single_replica_peer(replica);
        peer.init().unwrap();
        peer.start(BootstrapInfo::default()).unwrap();
        peer.shutdown();
        peer.shutdown();
    }

    #[test]
    fn change_config_updates_role_and_metadata() {
        let replica = ReplicaId::generate();
        let peer = single_replica_peer(replica);
        peer.init().unwrap();
        peer.start(BootstrapInfo::default()).unwrap();

        let other = ReplicaId::generate();
        let new_quorum = QuorumConfig::new(vec![
            PeerEntry {
                uuid: replica,
                address: "127.0.0.1:7050".into(),
                role: PeerRole::Follower,
            },
            PeerEntry {
                uuid: other,
                address: "127.0.0.1:7051".into(),
                role: PeerRole::Leader,
            },
        ]);
        peer.submit_change_config(new_quorum).unwrap();
        assert_eq!(peer.role(), PeerRole::Follower);

        peer.shutdown();
    }
}
