//! Loop roles, states and the legal transitions between them.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Whether a loop is the registry's distinguished main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopRole {
    /// The main loop. The only loop that can crash and be reinitialized.
    Main,
    /// Any other loop. A panic kills its thread.
    Background,
}

/// Control state of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Dispatching due tasks freely.
    Running,
    /// Only controller-submitted tasks run.
    Paused,
    /// Thread gone or going; absorbing.
    Terminated,
    /// Main loop only: a dispatched task panicked and the loop waits for reinitialization.
    Crashed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
            Self::Crashed => "crashed",
        })
    }
}

/// Error for a transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid {role:?} loop transition: {from} -> {to}")]
pub struct LoopTransitionError {
    /// Loop role.
    pub role: LoopRole,
    /// Current state.
    pub from: LoopState,
    /// Requested state.
    pub to: LoopState,
}

/// Returns true when `from -> to` is legal for a loop with `role`.
#[must_use]
pub fn is_valid_loop_transition(role: LoopRole, from: LoopState, to: LoopState) -> bool {
    use LoopState::{Crashed, Paused, Running, Terminated};

    if from == Terminated {
        return to == Terminated;
    }
    if from == to {
        return true;
    }
    match (from, to) {
        (Running | Paused, Crashed) => role == LoopRole::Main,
        (Running, Paused) | (Paused, Running) | (Crashed, Running | Paused) | (_, Terminated) => {
            true
        }
        _ => false,
    }
}

/// Validates a transition.
pub fn validate_loop_transition(
    role: LoopRole,
    from: LoopState,
    to: LoopState,
) -> Result<(), LoopTransitionError> {
    if is_valid_loop_transition(role, from, to) {
        Ok(())
    } else {
        Err(LoopTransitionError { role, from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_absorbing() {
        for to in [LoopState::Running, LoopState::Paused, LoopState::Crashed] {
            assert!(!is_valid_loop_transition(LoopRole::Main, LoopState::Terminated, to));
        }
        assert!(is_valid_loop_transition(
            LoopRole::Main,
            LoopState::Terminated,
            LoopState::Terminated
        ));
    }

    #[test]
    fn only_main_loop_crashes() {
        assert!(is_valid_loop_transition(LoopRole::Main, LoopState::Running, LoopState::Crashed));
        assert!(is_valid_loop_transition(LoopRole::Main, LoopState::Paused, LoopState::Crashed));
        let err = validate_loop_transition(
            LoopRole::Background,
            LoopState::Running,
            LoopState::Crashed,
        )
        .unwrap_err();
        assert!(err.to_string().contains("running -> crashed"), "{err}");
    }

    #[test]
    fn crashed_recovers_only_to_running_or_paused() {
        assert!(is_valid_loop_transition(LoopRole::Main, LoopState::Crashed, LoopState::Paused));
        assert!(is_valid_loop_transition(LoopRole::Main, LoopState::Crashed, LoopState::Running));
        assert!(is_valid_loop_transition(
            LoopRole::Main,
            LoopState::Crashed,
            LoopState::Terminated
        ));
    }

    #[test]
    fn states_serialize_snake_case() {
        let json = serde_json::to_string(&LoopState::Crashed).unwrap();
        assert_eq!(json, "\"crashed\"");
    }
}
