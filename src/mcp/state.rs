//! Client lifecycle state machine
//!
//! ```text
//! Uninitialized --open()--> Initializing --handshake resolves--> Ready
//! Ready --close()--> ShuttingDown --reader stopped & process reaped--> Terminated
//! Initializing --handshake timeout/error--> Terminated
//! Uninitialized --close()--> Terminated
//! ```
//!
//! Requests may only be sent in `Ready`; nothing is queued in other states.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::mcp::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Terminated,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::Initializing => "initializing",
            ClientState::Ready => "ready",
            ClientState::ShuttingDown => "shutting_down",
            ClientState::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Uninitialized, Terminated)
                | (Initializing, Ready)
                | (Initializing, Terminated)
                | (Ready, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    pub fn accepts_requests(self) -> bool {
        self == ClientState::Ready
    }

    pub fn is_terminal(self) -> bool {
        self == ClientState::Terminated
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe holder of the current [`ClientState`]
///
/// The lock is never held across an await point; every operation is a single
/// read or a single checked write.
#[derive(Debug)]
pub struct StateMachine {
    state: RwLock<ClientState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ClientState::Uninitialized),
        }
    }

    pub fn current(&self) -> ClientState {
        // ClientState is Copy and every write is a single assignment, so a
        // poisoned lock still holds a coherent value
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: ClientState) -> Result<ClientState, ClientError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = *state;
        if !current.can_transition_to(next) {
            return Err(ClientError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        *state = next;
        debug!("Client state: {} -> {}", current, next);
        Ok(current)
    }

    /// Fail with `NotReady` unless requests are currently accepted
    pub fn ensure_ready(&self) -> Result<(), ClientError> {
        let state = self.current();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(ClientError::NotReady { state })
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let machine = StateMachine::new();
        assert_eq!(machine.current(), ClientState::Uninitialized);

        for next in [
            ClientState::Initializing,
            ClientState::Ready,
            ClientState::ShuttingDown,
            ClientState::Terminated,
        ] {
            machine.transition(next).unwrap();
            assert_eq!(machine.current(), next);
        }
        assert!(machine.current().is_terminal());
    }

    #[test]
    fn test_failed_handshake_goes_straight_to_terminated() {
        let machine = StateMachine::new();
        machine.transition(ClientState::Initializing).unwrap();
        assert_eq!(
            machine.transition(ClientState::Terminated).unwrap(),
            ClientState::Initializing
        );
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let machine = StateMachine::new();
        let result = machine.transition(ClientState::Ready);
        assert!(matches!(
            result,
            Err(ClientError::InvalidTransition {
                from: ClientState::Uninitialized,
                to: ClientState::Ready
            })
        ));
        assert_eq!(machine.current(), ClientState::Uninitialized);

        machine.transition(ClientState::Terminated).unwrap();
        assert!(machine.transition(ClientState::Initializing).is_err());
    }

    #[test]
    fn test_only_ready_accepts_requests() {
        let machine = StateMachine::new();
        assert!(matches!(
            machine.ensure_ready(),
            Err(ClientError::NotReady {
                state: ClientState::Uninitialized
            })
        ));

        machine.transition(ClientState::Initializing).unwrap();
        assert!(machine.ensure_ready().is_err());

        machine.transition(ClientState::Ready).unwrap();
        assert!(machine.ensure_ready().is_ok());

        machine.transition(ClientState::ShuttingDown).unwrap();
        assert!(matches!(
            machine.ensure_ready(),
            Err(ClientError::NotReady {
                state: ClientState::ShuttingDown
            })
        ));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ClientState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(ClientState::Ready.to_string(), "ready");
    }
}
