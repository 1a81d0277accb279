//! Coordinator lifecycle: Idle → Sensing → WakePending → Idle.
//! Screen-on is the only way back to Idle and the only session reset point.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineState {
    /// Screen on, no detectors active.
    Idle,
    /// Screen off, detectors active, wake-lock possibly held.
    Sensing,
    /// A decision is latched; the wake action is in flight.
    WakePending,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Sensing => write!(f, "Sensing"),
            EngineState::WakePending => write!(f, "WakePending"),
        }
    }
}

impl EngineState {
    pub fn can_transition_to(self, next: EngineState) -> bool {
        matches!(
            (self, next),
            (EngineState::Idle, EngineState::Sensing)
                | (EngineState::Sensing, EngineState::WakePending)
                | (EngineState::Sensing, EngineState::Idle)
                | (EngineState::WakePending, EngineState::Idle)
        )
    }

    /// Detectors are registered in this state.
    pub fn is_active(self) -> bool {
        !matches!(self, EngineState::Idle)
    }
}

/// Thread-safe state holder with a watch channel for subscribers.
pub struct StateMachine {
    state: RwLock<EngineState>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        Self {
            state: RwLock::new(EngineState::Idle),
            state_tx,
            state_rx,
        }
    }

    pub fn current(&self) -> EngineState {
        *self.state.read()
    }

    /// Attempt a transition. Returns Ok(new_state) or Err with reason.
    pub fn transition(&self, next: EngineState) -> Result<EngineState, String> {
        let mut state = self.state.write();
        self.apply(&mut state, next)
    }

    /// Transition only if `still_valid` holds, evaluated under the state lock.
    /// `None` means the condition failed and the state was left alone.
    pub fn transition_if(
        &self,
        next: EngineState,
        still_valid: impl FnOnce() -> bool,
    ) -> Option<Result<EngineState, String>> {
        let mut state = self.state.write();
        if !still_valid() {
            return None;
        }
        Some(self.apply(&mut state, next))
    }

    fn apply(&self, state: &mut EngineState, next: EngineState) -> Result<EngineState, String> {
        let current = *state;
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {} -> {}", current, next);
            warn!("{}", msg);
            return Err(msg);
        }
        *state = next;
        let _ = self.state_tx.send(next);
        info!(from = %current, to = %next, "state_transition");
        Ok(next)
    }

    /// Back to Idle from anywhere (screen-on).
    pub fn force_idle(&self) {
        let mut state = self.state.write();
        let prev = *state;
        *state = EngineState::Idle;
        let _ = self.state_tx.send(EngineState::Idle);
        if prev != EngineState::Idle {
            info!(from = %prev, "force_idle");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
