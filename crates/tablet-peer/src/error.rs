//! Error types for the tablet peer core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type TabletResult<T> = Result<T, TabletError>;

/// Errors surfaced at the tablet peer boundary.
///
/// Transient consensus errors are surfaced to the submitter as
/// [`TabletError::Aborted`]; log-GC errors are logged and retried on the
/// next tick rather than returned; apply errors are fatal to the tablet and
/// drive the peer toward `Quiescing` (see [`crate::facade::TabletPeer`]).
#[derive(Debug, Error)]
pub enum TabletError {
    /// The peer is not in the `Running` state.
    #[error("service unavailable: peer state is {state}")]
    ServiceUnavailable {
        /// Name of the state the peer was actually in, for diagnostics.
        state: &'static str,
    },

    /// A submitted payload failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The log or storage collaborator reported an I/O failure.
    #[error("i/o error: {0}")]
    IoError(String),

    /// Consensus aborted the round (quorum loss, leadership change, timeout).
    #[error("aborted: {0}")]
    Aborted(String),

    /// A lifecycle invariant was violated; indicates a programming bug.
    #[error("illegal state transition: {from} -> {to}")]
    IllegalState {
        from: &'static str,
        to: &'static str,
    },
}

impl TabletError {
    pub fn service_unavailable(state: &'static str) -> Self {
        Self::ServiceUnavailable { state }
    }
}
