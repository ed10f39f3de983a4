//! The peer lifecycle state machine.
//!
//! All state inspections and transitions take a short exclusive latch over
//! the state field only; no long-running work is performed while holding
//! it.

use std::sync::Mutex;

use crate::error::TabletError;

/// One of the five lifecycle states a tablet peer can be in.
///
/// Transitions are monotonic except that `Quiescing` may be entered from
/// any non-`Shutdown` state. No operation is admitted except in `Running`,
/// and the state never regresses to `Bootstrapping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Bootstrapping,
    Configuring,
    Running,
    Quiescing,
    Shutdown,
}

impl PeerState {
    pub fn name(self) -> &'static str {
        match self {
            PeerState::Bootstrapping => "BOOTSTRAPPING",
            PeerState::Configuring => "CONFIGURING",
            PeerState::Running => "RUNNING",
            PeerState::Quiescing => "QUIESCING",
            PeerState::Shutdown => "SHUTDOWN",
        }
    }
}

/// Guards the peer's lifecycle state behind a short exclusive latch.
pub struct LifecycleController {
    state: Mutex<PeerState>,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PeerState::Bootstrapping),
        }
    }

    pub fn current(&self) -> PeerState {
        *self.state.lock().expect("lifecycle mutex poisoned")
    }

    /// `Bootstrapping -> Configuring`. Fails if not currently `Bootstrapping`.
    pub fn init(&self) -> Result<(), TabletError> {
        let mut state = self.state.lock().expect("lifecycle mutex poisoned");
        if *state != PeerState::Bootstrapping {
            return Err(TabletError::IllegalState {
                from: state.name(),
                to: PeerState::Configuring.name(),
            });
        }
        *state = PeerState::Configuring;
        tracing::info!(to = "CONFIGURING", "lifecycle transition");
        Ok(())
    }

    /// `Configuring -> Running`. Fails if not currently `Configuring`.
    pub fn start(&self) -> Result<(), TabletError> {
        let mut state = self.state.lock().expect("lifecycle mutex poisoned");
        if *state != PeerState::Configuring {
            return Err(TabletError::IllegalState {
                from: state.name(),
                to: PeerState::Running.name(),
            });
        }
        *state = PeerState::Running;
        tracing::info!(to = "RUNNING", "lifecycle transition");
        Ok(())
    }

    /// Fails with [`TabletError::ServiceUnavailable`] unless the peer is
    /// currently `Running`.
    pub fn check_running(&self) -> Result<(), TabletError> {
        let state = self.current();
        if state == PeerState::Running {
            Ok(())
        } else {
            Err(TabletError::service_unavailable(state.name()))
        }
    }

    /// Moves the peer to `Quiescing`, returning the prior state. Idempotent:
    /// a second call while already `Quiescing` or `Shutdown` is a no-op that
    /// returns the current state without re-entering `Quiescing`.
    pub fn begin_shutdown(&self) -> PeerState {
        let mut state = self.state.lock().expect("lifecycle mutex poisoned");
        let prior = *state;
        if prior == PeerState::Quiescing || prior == PeerState::Shutdown {
            return prior;
        }
        *state = PeerState::Quiescing;
        tracing::info!(from = prior.name(), to = "QUIESCING", "lifecycle transition");
        prior
    }

    /// `Quiescing -> Shutdown`. Idempotent.
    pub fn finish_shutdown(&self) {
        let mut state = self.state.lock().expect("lifecycle mutex poisoned");
        if *state == PeerState::Shutdown {
            return;
        }
        *state = PeerState::Shutdown;
        tracing::info!(to = "SHUTDOWN", "lifecycle transition");
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let lc = LifecycleController::new();
        assert_eq!(lc.current(), PeerState::Bootstrapping);
        lc.init().unwrap();
        assert_eq!(lc.current(), PeerState::Configuring);
        lc.start().unwrap();
        assert_eq!(lc.current(), PeerState::Running);
        assert!(lc.check_running().is_ok());
    }

    #[test]
    fn init_twice_fails() {
        let lc = LifecycleController::new();
        lc.init().unwrap();
        assert!(lc.init().is_err());
    }

    #[test]
    fn start_before_init_fails() {
        let lc = LifecycleController::new();
        assert!(lc.start().is_err());
    }

    #[test]
    fn check_running_fails_with_state_name() {
        let lc = LifecycleController::new();
        let err = lc.check_running().unwrap_err();
        match err {
            TabletError::ServiceUnavailable { state } => assert_eq!(state, "BOOTSTRAPPING"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shutdown_is_idempotent_and_returns_prior_state() {
        let lc = LifecycleController::new();
        lc.init().unwrap();
        lc.start().unwrap();

        let prior = lc.begin_shutdown();
        assert_eq!(prior, PeerState::Running);
        lc.finish_shutdown();
        assert_eq!(lc.current(), PeerState::Shutdown);

        // Second call: no teardown repeated, returns current (terminal) state.
        let prior_again = lc.begin_shutdown();
        assert_eq!(prior_again, PeerState::Shutdown);
    }

    #[test]
    fn shutdown_from_bootstrapping_is_allowed() {
        let lc = LifecycleController::new();
        let prior = lc.begin_shutdown();
        assert_eq!(prior, PeerState::Bootstrapping);
        assert_eq!(lc.current(), PeerState::Quiescing);
    }
}
