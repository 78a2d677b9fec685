//! Process lifecycle management.
//!
//! Orchestrator state machine:
//!
//! ```text
//! INIT → SETUP → RUNNING
//!   ↓      ↓        ↓
//!   └──────┴──→ STOPPING → STOPPED
//! ```
//!
//! The state lives in a `watch` channel so that transitions are atomic
//! check-and-set operations and other tasks can await a particular state.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use crate::types::{Error, Result};

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Init,
    Setup,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    /// Check if shutdown has begun or finished.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, LifecycleState::Stopping | LifecycleState::Stopped)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        match (self, to) {
            (LifecycleState::Init, LifecycleState::Setup) => true,
            (LifecycleState::Setup, LifecycleState::Running) => true,
            // Shutdown may begin from any live state
            (LifecycleState::Init, LifecycleState::Stopping) => true,
            (LifecycleState::Setup, LifecycleState::Stopping) => true,
            (LifecycleState::Running, LifecycleState::Stopping) => true,
            (LifecycleState::Stopping, LifecycleState::Stopped) => true,
            // STOPPED is terminal
            (LifecycleState::Stopped, _) => false,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Init => "INIT",
            LifecycleState::Setup => "SETUP",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Lifecycle cell - owns the current state of one orchestrator.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Init);
        Self { tx }
    }

    /// Current state.
    pub fn current(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Transition to `to`, rejecting invalid transitions.
    pub fn transition(&self, to: LifecycleState) -> Result<()> {
        let mut rejected_from = None;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(to) {
                tracing::debug!("lifecycle_transition: from={}, to={}", state, to);
                *state = to;
                true
            } else {
                rejected_from = Some(*state);
                false
            }
        });
        match rejected_from {
            None => Ok(()),
            Some(from) => Err(Error::state_transition(format!(
                "cannot transition from {} to {}",
                from, to
            ))),
        }
    }

    /// Move to STOPPING unless shutdown already began.
    ///
    /// Returns `true` for exactly one caller: the one that owns the teardown.
    pub fn begin_stop(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_shutting_down() {
                false
            } else {
                tracing::debug!("lifecycle_transition: from={}, to=STOPPING", state);
                *state = LifecycleState::Stopping;
                true
            }
        })
    }

    /// Receiver for observing transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `pred`.
    // The binding releases the channel's read guard before `rx` is dropped.
    #[allow(clippy::let_and_return)]
    pub async fn wait_for(&self, pred: impl Fn(LifecycleState) -> bool) -> LifecycleState {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| pred(*s)).await {
            Ok(state) => *state,
            // Sender lives in `self`, so the channel cannot close while we borrow it.
            Err(_) => self.current(),
        };
        state
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_state_transitions() {
        let lc = Lifecycle::new();
        assert_eq!(lc.current(), LifecycleState::Init);

        lc.transition(LifecycleState::Setup).unwrap();
        lc.transition(LifecycleState::Running).unwrap();
        assert!(lc.begin_stop());
        lc.transition(LifecycleState::Stopped).unwrap();
        assert_eq!(lc.current(), LifecycleState::Stopped);
    }

    #[test]
    fn test_state_validation() {
        assert!(LifecycleState::Init.can_transition_to(LifecycleState::Setup));
        assert!(LifecycleState::Setup.can_transition_to(LifecycleState::Running));
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Stopping));
        assert!(LifecycleState::Stopping.can_transition_to(LifecycleState::Stopped));

        assert!(!LifecycleState::Init.can_transition_to(LifecycleState::Running));
        assert!(!LifecycleState::Running.can_transition_to(LifecycleState::Setup));
        assert!(!LifecycleState::Stopped.can_transition_to(LifecycleState::Init));
        assert!(!LifecycleState::Stopping.can_transition_to(LifecycleState::Running));
    }

    #[test]
    fn test_transition_invalid_state_fails() {
        let lc = Lifecycle::new();
        let err = lc.transition(LifecycleState::Running).unwrap_err();
        assert!(err.to_string().contains("cannot transition from INIT to RUNNING"));
        assert_eq!(lc.current(), LifecycleState::Init);
    }

    #[test]
    fn test_begin_stop_is_idempotent() {
        let lc = Lifecycle::new();
        lc.transition(LifecycleState::Setup).unwrap();
        assert!(lc.begin_stop());
        assert!(!lc.begin_stop());
        lc.transition(LifecycleState::Stopped).unwrap();
        assert!(!lc.begin_stop());
        assert_eq!(lc.current(), LifecycleState::Stopped);
    }

    #[test]
    fn test_begin_stop_has_single_winner_across_threads() {
        let lc = Arc::new(Lifecycle::new());
        lc.transition(LifecycleState::Setup).unwrap();
        lc.transition(LifecycleState::Running).unwrap();

        let winners: usize = (0..8)
            .map(|_| {
                let lc = lc.clone();
                std::thread::spawn(move || lc.begin_stop())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_wait_for_observes_transition() {
        let lc = Arc::new(Lifecycle::new());
        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.wait_for(|s| s == LifecycleState::Setup).await })
        };
        lc.transition(LifecycleState::Setup).unwrap();
        assert_eq!(waiter.await.unwrap(), LifecycleState::Setup);
    }

    #[test]
    fn test_serialization_uses_upper_case() {
        let json = serde_json::to_string(&LifecycleState::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
    }
}
