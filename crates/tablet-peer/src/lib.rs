//! Per-shard coordination core for a distributed tabular storage engine.
//!
//! A [`facade::TabletPeer`] owns one tablet's lifecycle, its in-flight
//! operations, and the executor pools and background log-GC worker that
//! drive them. It reaches consensus, the write-ahead log, the storage
//! engine, and tablet metadata only through the traits in
//! [`collaborators`]; [`testkit`] provides in-memory implementations of all
//! four for tests.

pub mod collaborators;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod facade;
pub mod gc;
pub mod lifecycle;
pub mod testkit;
pub mod tracker;

pub use collaborators::{
    AnchorHandle, AnchorRegistry, BootstrapInfo, Clock, CommitContinuation, Consensus, Log,
    LogRecord, LogRecordKind, MetadataStore, MvccManager, OperationKind, OperationState, Storage,
    StorageMetrics, TabletStatus,
};
pub use config::TabletPeerConfig;
pub use error::{TabletError, TabletResult};
pub use facade::TabletPeer;
pub use lifecycle::PeerState;
pub use tracker::{PendingOperation, TrackerMetrics};

pub use tablet_peer_types::{OpId, PeerEntry, PeerRole, QuorumConfig, ReplicaId, TabletId};
