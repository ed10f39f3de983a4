//! # tablet-peer-types
//!
//! Identifiers and ordering primitives shared between the tablet peer core
//! and its external collaborators (consensus, log, storage, metadata).
//!
//! - [`OpId`]: the `(term, index)` pair consensus assigns to replicated
//!   operations.
//! - [`TabletId`] / [`ReplicaId`]: stable identifiers for a tablet and a
//!   replica within its quorum.
//! - [`PeerRole`]: a replica's role within the current quorum configuration.

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

/// Totally ordered position assigned by consensus to a replicated operation.
///
/// Ordering is lexicographic on `(term, index)`: term is monotonically
/// non-decreasing across leadership changes, and index increases by one per
/// entry replicated within a term. [`OpId::MIN`] is the sentinel used when
/// nothing is known yet (e.g. an empty log with no anchors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    /// Sentinel value lower than every real `OpId`; "retain everything".
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// The next index within the same term.
    #[must_use]
    pub fn next_index(self) -> Self {
        Self {
            term: self.term,
            index: self.index + 1,
        }
    }

    /// `true` if this is the sentinel minimum.
    pub fn is_min(self) -> bool {
        self == Self::MIN
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::MIN
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}.{})", self.term, self.index)
    }
}

/// Identifier for a tablet (a horizontal partition of one table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletId(uuid::Uuid);

impl TabletId {
    pub fn new(id: uuid::Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(self) -> uuid::Uuid {
        self.0
    }
}

impl Display for TabletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one replica of a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(uuid::Uuid);

impl ReplicaId {
    pub fn new(id: uuid::Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replica's role within a quorum configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Leader,
    Follower,
    Learner,
    /// Reported by `role()` when this replica's UUID is absent from the
    /// last persisted quorum.
    NonParticipant,
}

/// One entry in a [`QuorumConfig`](crate::QuorumConfig).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub uuid: ReplicaId,
    pub address: String,
    pub role: PeerRole,
}

/// The ordered set of peers configured for a tablet and their roles.
///
/// Persisted through the metadata collaborator and re-read on
/// `TabletPeer::start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    pub peers: Vec<PeerEntry>,
}

impl QuorumConfig {
    pub fn new(peers: Vec<PeerEntry>) -> Self {
        Self { peers }
    }

    pub fn single(uuid: ReplicaId, address: impl Into<String>) -> Self {
        Self {
            peers: vec![PeerEntry {
                uuid,
                address: address.into(),
                role: PeerRole::Leader,
            }],
        }
    }

    /// Role of `uuid` in this configuration, or `NonParticipant` if absent.
    pub fn role_of(&self, uuid: ReplicaId) -> PeerRole {
        self.peers
            .iter()
            .find(|p| p.uuid == uuid)
            .map_or(PeerRole::NonParticipant, |p| p.role)
    }
}
