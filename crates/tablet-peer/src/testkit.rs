//! In-memory collaborator doubles used by this crate's own tests.
//!
//! None of these are meant to be realistic (the log keeps everything in a
//! `Vec`, consensus is a single replica that always agrees with itself) —
//! they exist to exercise the core's sequencing and error handling without
//! pulling in a real wire protocol, on-disk format, or row store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tablet_peer_types::{OpId, QuorumConfig, TabletId};

use crate::collaborators::{
    AnchorHandle, AnchorRegistry, BootstrapInfo, Clock, Consensus, Log, LogRecord, MetadataStore,
    MvccManager, OperationState, Storage, StorageMetrics,
};
use crate::driver::ConsensusRound;
use crate::error::{TabletError, TabletResult};

/// Reads the wall clock, mirroring a production `Clock` implementation
/// backed by a monotone time source.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos() as u64
    }
}

/// A clock whose value a test sets directly.
pub struct FakeClock(AtomicU64);

impl FakeClock {
    pub fn new(start_ns: u64) -> Self {
        Self(AtomicU64::new(start_ns))
    }

    pub fn set(&self, value_ns: u64) {
        self.0.store(value_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.0.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

const SEGMENT_SIZE: usize = 4;

/// An append-only log kept entirely in memory, split into fixed-size
/// segments so GC can be tested at segment granularity the same way a
/// production log only reclaims whole files.
pub struct InMemoryLog {
    segments: Mutex<Vec<Vec<LogRecord>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            segments: Mutex::new(vec![Vec::new()]),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.segments
            .lock()
            .expect("log mutex poisoned")
            .iter()
            .map(Vec::len)
            .sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.lock().expect("log mutex poisoned").len()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for InMemoryLog {
    fn append(&self, record: LogRecord) -> TabletResult<()> {
        let mut segments = self.segments.lock().expect("log mutex poisoned");
        let last = segments.last_mut().expect("log always has a live segment");
        last.push(record);
        if last.len() >= SEGMENT_SIZE {
            segments.push(Vec::new());
        }
        Ok(())
    }

    fn get_last_entry_op_id(&self) -> Option<OpId> {
        let segments = self.segments.lock().expect("log mutex poisoned");
        segments
            .iter()
            .rev()
            .find_map(|segment| segment.last())
            .map(|record| record.op_id)
    }

    fn gc(&self, min_op_id: OpId) -> TabletResult<usize> {
        let mut segments = self.segments.lock().expect("log mutex poisoned");
        let mut reclaimed = 0;
        while segments.len() > 1 {
            let fully_below = segments[0]
                .last()
                .map(|record| record.op_id < min_op_id)
                .unwrap_or(true);
            if !fully_below {
                break;
            }
            segments.remove(0);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    fn close(&self) -> TabletResult<()> {
        Ok(())
    }
}

/// Always reports no pinned position; most tests that don't exercise
/// scanner pinning can use this instead of a real registry.
pub struct NullRegistry;

impl NullRegistry {
    pub const fn new() -> Self {
        Self
    }
}

impl AnchorRegistry for NullRegistry {
    fn register(&self, _op_id: OpId, _owner_tag: &str) -> AnchorHandle {
        AnchorHandle(0)
    }
    fn unregister(&self, _handle: AnchorHandle) {}
    fn earliest(&self) -> Option<OpId> {
        None
    }
}

/// A registry backed by a `HashMap`, for tests that need real pinning.
pub struct InMemoryAnchorRegistry {
    next_handle: AtomicU64,
    anchors: Mutex<HashMap<u64, OpId>>,
}

impl InMemoryAnchorRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            anchors: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAnchorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AnchorRegistry for InMemoryAnchorRegistry {
    fn register(&self, op_id: OpId, _owner_tag: &str) -> AnchorHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.anchors
            .lock()
            .expect("registry mutex poisoned")
            .insert(handle, op_id);
        AnchorHandle(handle)
    }

    fn unregister(&self, handle: AnchorHandle) {
        self.anchors
            .lock()
            .expect("registry mutex poisoned")
            .remove(&handle.0);
    }

    fn earliest(&self) -> Option<OpId> {
        self.anchors
            .lock()
            .expect("registry mutex poisoned")
            .values()
            .copied()
            .min()
    }
}

/// Never advances; safe-timestamp-dependent paths become no-ops.
pub struct NullMvcc;

impl NullMvcc {
    pub const fn new() -> Self {
        Self
    }
}

impl MvccManager for NullMvcc {
    fn safe_timestamp(&self) -> u64 {
        0
    }
    fn update_safe_timestamp(&self, _timestamp: u64) {}
}

/// A watermark that actually moves, backed by an atomic.
#[derive(Default)]
pub struct InMemoryMvcc(AtomicU64);

impl MvccManager for InMemoryMvcc {
    fn safe_timestamp(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
    fn update_safe_timestamp(&self, timestamp: u64) {
        self.0.fetch_max(timestamp, Ordering::SeqCst);
    }
}

/// Applies every operation to an append-only journal of payloads; never
/// fails. Good enough to assert "N operations were applied, in this order".
pub struct InMemoryStorage {
    applied: Mutex<Vec<Vec<u8>>>,
    failures: AtomicU64,
    registry: InMemoryAnchorRegistry,
    mvcc: InMemoryMvcc,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            failures: AtomicU64::new(0),
            registry: InMemoryAnchorRegistry::new(),
            mvcc: InMemoryMvcc::default(),
        }
    }

    pub fn applied_payloads(&self) -> Vec<Vec<u8>> {
        self.applied.lock().expect("storage mutex poisoned").clone()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for InMemoryStorage {
    fn apply(&self, state: &OperationState) -> TabletResult<()> {
        self.applied
            .lock()
            .expect("storage mutex poisoned")
            .push(state.payload.clone());
        Ok(())
    }

    fn metrics(&self) -> StorageMetrics {
        StorageMetrics {
            applied_operations: self.applied.lock().expect("storage mutex poisoned").len() as u64,
            apply_failures: self.failures.load(Ordering::SeqCst),
        }
    }

    fn mvcc_manager(&self) -> &dyn MvccManager {
        &self.mvcc
    }

    fn opid_anchor_registry(&self) -> &dyn AnchorRegistry {
        &self.registry
    }

    fn estimate_on_disk_size(&self) -> u64 {
        self.applied
            .lock()
            .expect("storage mutex poisoned")
            .iter()
            .map(|payload| payload.len() as u64)
            .sum()
    }

    fn unregister_maintenance_ops(&self) {}
}

/// Holds a tablet's identity and quorum in memory; `flush` is a no-op.
pub struct InMemoryMetadataStore {
    tablet_id: TabletId,
    quorum: Mutex<QuorumConfig>,
}

impl InMemoryMetadataStore {
    pub fn new(tablet_id: TabletId, quorum: QuorumConfig) -> Self {
        Self {
            tablet_id,
            quorum: Mutex::new(quorum),
        }
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn oid(&self) -> TabletId {
        self.tablet_id
    }

    fn quorum(&self) -> QuorumConfig {
        self.quorum.lock().expect("metadata mutex poisoned").clone()
    }

    fn set_quorum(&self, quorum: QuorumConfig) {
        *self.quorum.lock().expect("metadata mutex poisoned") = quorum;
    }

    fn flush(&self) -> TabletResult<()> {
        Ok(())
    }
}

/// A single-replica consensus double: every `replicate` call is immediately
/// "quorum reached", assigning OpIds from a single monotone counter within
/// one fixed term. Useful for exercising the driver and GC machinery without
/// a real replication protocol.
pub struct LocalConsensus {
    term: u64,
    next_index: AtomicU64,
    shut_down: Mutex<bool>,
}

impl LocalConsensus {
    pub fn new() -> Self {
        Self {
            term: 1,
            next_index: AtomicU64::new(1),
            shut_down: Mutex::new(false),
        }
    }

    /// The OpId that will be assigned to the next round, without consuming
    /// it — useful for tests asserting GC boundaries ahead of time.
    pub fn peek_next_op_id(&self) -> OpId {
        OpId::new(self.term, self.next_index.load(Ordering::SeqCst))
    }
}

impl Default for LocalConsensus {
    fn default() -> Self {
        Self::new()
    }
}

impl Consensus for LocalConsensus {
    fn start(
        &self,
        initial_quorum: QuorumConfig,
        _bootstrap_info: BootstrapInfo,
    ) -> TabletResult<QuorumConfig> {
        Ok(initial_quorum)
    }

    fn replicate(&self, round: Arc<ConsensusRound>) -> TabletResult<()> {
        if *self.shut_down.lock().expect("consensus mutex poisoned") {
            round.mark_replicated(Err(TabletError::Aborted(
                "consensus is shutting down".into(),
            )));
            return Ok(());
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let op_id = OpId::new(self.term, index);
        round.mark_replicated(Ok(op_id));
        Ok(())
    }

    fn shutdown(&self) {
        *self.shut_down.lock().expect("consensus mutex poisoned") = true;
    }
}

/// Groups the doubles above under the module path `driver.rs`'s tests
/// import from.
pub mod local {
    pub use super::{FakeClock, InMemoryAnchorRegistry, InMemoryMvcc, LocalConsensus, NullMvcc, NullRegistry, SystemClock};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LogRecordKind, OperationKind};

    #[test]
    fn in_memory_log_rolls_segments_at_capacity() {
        let log = InMemoryLog::new();
        for i in 1..=10u64 {
            log.append(LogRecord {
                op_id: OpId::new(1, i),
                kind: LogRecordKind::Replicate,
                payload: Vec::new(),
            })
            .unwrap();
        }
        assert_eq!(log.entry_count(), 10);
        assert!(log.segment_count() >= 2);
    }

    #[test]
    fn in_memory_log_gc_only_removes_fully_covered_segments() {
        let log = InMemoryLog::new();
        for i in 1..=8u64 {
            log.append(LogRecord {
                op_id: OpId::new(1, i),
                kind: LogRecordKind::Replicate,
                payload: Vec::new(),
            })
            .unwrap();
        }
        // First segment holds indices 1..=4, second holds 5..=8 (plus a
        // fresh empty third segment after rolling at size 8).
        let reclaimed = log.gc(OpId::new(1, 5)).unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(log.get_last_entry_op_id(), Some(OpId::new(1, 8)));
    }

    #[test]
    fn in_memory_anchor_registry_tracks_earliest() {
        let registry = InMemoryAnchorRegistry::new();
        let a = registry.register(OpId::new(1, 5), "scan-a");
        let _b = registry.register(OpId::new(1, 2), "scan-b");
        assert_eq!(registry.earliest(), Some(OpId::new(1, 2)));
        registry.unregister(a);
        assert_eq!(registry.earliest(), Some(OpId::new(1, 2)));
    }

    #[test]
    fn local_consensus_assigns_increasing_indices_in_one_term() {
        let consensus = LocalConsensus::new();
        consensus
            .start(QuorumConfig::new(Vec::new()), BootstrapInfo::default())
            .unwrap();
        let round_a = ConsensusRound::for_replica(
            OperationState::new(OperationKind::Write, Vec::new()),
            Arc::new(NoopContinuation),
        );
        consensus.replicate(round_a).unwrap();
        assert_eq!(consensus.peek_next_op_id(), OpId::new(1, 2));
    }

    struct NoopContinuation;
    impl crate::collaborators::CommitContinuation for NoopContinuation {
        fn on_commit(&self, _op_id: OpId) -> TabletResult<()> {
            Ok(())
        }
    }
}
