//! External interfaces.
//!
//! The core treats consensus, the write-ahead log, the storage engine, and
//! tablet metadata as collaborators reached only through these traits.
//! Their implementations (MVCC, row layout, compaction, wire protocol,
//! on-disk log format) are out of scope; [`crate::testkit`] provides
//! in-memory doubles used by this crate's own tests.

use std::sync::Arc;

use tablet_peer_types::{OpId, QuorumConfig, TabletId};

use crate::error::TabletResult;

/// A monotone clock external to the core: the core only reads from it, it
/// never owns or advances time itself.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// The kind of operation a driver shepherds through its phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Write,
    AlterSchema,
    ChangeConfig,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Write => "WRITE",
            OperationKind::AlterSchema => "ALTER_SCHEMA",
            OperationKind::ChangeConfig => "CHANGE_CONFIG",
        }
    }
}

/// An operation's payload, opaque to the core. The payload's interpretation
/// and application action belong entirely to the storage collaborator.
#[derive(Debug, Clone)]
pub struct OperationState {
    pub kind: OperationKind,
    pub payload: Vec<u8>,
}

impl OperationState {
    pub fn new(kind: OperationKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

/// OpIds the consensus collaborator needs to resume replication on `start`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootstrapInfo {
    pub last_committed_op_id: OpId,
}

/// A single durable record written through the log collaborator.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub op_id: OpId,
    pub kind: LogRecordKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordKind {
    Replicate,
    Commit,
}

/// Append-only write-ahead log.
///
/// GC below a supplied OpId boundary is non-destructive: segments are only
/// removed once every entry they contain sorts strictly below the boundary,
/// so truncation is rounded up to segment granularity.
pub trait Log: Send + Sync {
    fn append(&self, record: LogRecord) -> TabletResult<()>;
    fn get_last_entry_op_id(&self) -> Option<OpId>;
    /// Deletes segments strictly below `min_op_id`, returning the number of
    /// segments reclaimed.
    fn gc(&self, min_op_id: OpId) -> TabletResult<usize>;
    fn close(&self) -> TabletResult<()>;
}

/// A pinned OpId preventing the log GC from advancing past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorHandle(pub u64);

/// Set of pinned OpIds. Consulted read-only by the GC worker; mutated by
/// scan sessions whose lifecycle is outside this spec.
pub trait AnchorRegistry: Send + Sync {
    fn register(&self, op_id: OpId, owner_tag: &str) -> AnchorHandle;
    fn unregister(&self, handle: AnchorHandle);
    fn earliest(&self) -> Option<OpId>;
}

/// The tablet's safe-read watermark, surfaced through `get_safe_timestamp`.
pub trait MvccManager: Send + Sync {
    fn safe_timestamp(&self) -> u64;
    fn update_safe_timestamp(&self, timestamp: u64);
}

/// Point-in-time counters surfaced through `get_status`.
#[derive(Debug, Clone, Default)]
pub struct StorageMetrics {
    pub applied_operations: u64,
    pub apply_failures: u64,
}

/// The storage engine collaborator.
pub trait Storage: Send + Sync {
    fn apply(&self, state: &OperationState) -> TabletResult<()>;
    fn metrics(&self) -> StorageMetrics;
    fn mvcc_manager(&self) -> &dyn MvccManager;
    fn opid_anchor_registry(&self) -> &dyn AnchorRegistry;
    fn estimate_on_disk_size(&self) -> u64;
    fn unregister_maintenance_ops(&self);
}

/// Persisted tablet metadata.
pub trait MetadataStore: Send + Sync {
    fn oid(&self) -> TabletId;
    fn quorum(&self) -> QuorumConfig;
    fn set_quorum(&self, quorum: QuorumConfig);
    fn flush(&self) -> TabletResult<()>;
}

/// Human-facing status snapshot. Field ordering carries no stability
/// guarantee.
#[derive(Debug, Clone)]
pub struct TabletStatus {
    pub tablet_id: TabletId,
    pub table_name: String,
    pub last_status: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub state_name: &'static str,
    pub estimated_on_disk_size: u64,
}

/// Capability a replica driver installs on its [`ConsensusRound`] so
/// consensus can acknowledge a commit without holding a raw pointer back
/// into the driver.
pub trait CommitContinuation: Send + Sync {
    fn on_commit(&self, op_id: OpId) -> TabletResult<()>;
}

/// The consensus collaborator.
///
/// `replicate` is asynchronous: it returns once the round has been
/// accepted for processing, and the round's completion channel
/// (`ConsensusRound::wait_replicated`) is what actually blocks the driver
/// until the OpId is assigned and quorum is reached.
pub trait Consensus: Send + Sync {
    fn start(
        &self,
        initial_quorum: QuorumConfig,
        bootstrap_info: BootstrapInfo,
    ) -> TabletResult<QuorumConfig>;
    fn replicate(&self, round: Arc<crate::driver::ConsensusRound>) -> TabletResult<()>;
    fn shutdown(&self);
}
