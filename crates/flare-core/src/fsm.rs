//! Generic finite-state-machine engine
//!
//! Every long-running network interaction in the client is driven by one
//! instance of this table-based machine: transitions are registered as
//! `(state, command) -> state` triples at construction time and the table is
//! read-only afterwards. Advancing on an unregistered pair is a contract
//! violation, not a runtime condition, and fails loudly.

use core::fmt;
use core::hash::Hash;
use std::collections::HashMap;

use tracing::warn;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// No transition was registered for the attempted `(state, command)` pair.
///
/// This indicates a missing state-handling branch in the service that built
/// the table; it must never be swallowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no transition registered for state {state} on command {command}")]
pub struct TransitionUndefined {
    pub state: String,
    pub command: String,
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Table-driven finite-state machine over a service-specific state and
/// command enum pair.
#[derive(Debug, Clone)]
pub struct Fsm<S, C> {
    current: S,
    transitions: HashMap<(S, C), S>,
}

impl<S, C> Fsm<S, C>
where
    S: Copy + Eq + Hash + fmt::Debug,
    C: Copy + Eq + Hash + fmt::Debug,
{
    /// Create a machine starting in `initial` with an empty table.
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            transitions: HashMap::new(),
        }
    }

    /// Register a `(state, command) -> next` transition.
    ///
    /// Re-registering an already-known pair is a no-op; the first
    /// registration wins.
    pub fn register(&mut self, state: S, command: C, next: S) -> &mut Self {
        self.transitions.entry((state, command)).or_insert(next);
        self
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.current
    }

    /// Look up the transition for the current state and `command`, mutate
    /// the current state, and return it.
    pub fn advance(&mut self, command: C) -> Result<S, TransitionUndefined> {
        match self.transitions.get(&(self.current, command)) {
            Some(&next) => {
                self.current = next;
                Ok(next)
            }
            None => Err(TransitionUndefined {
                state: format!("{:?}", self.current),
                command: format!("{:?}", command),
            }),
        }
    }

    /// Supervisory override that bypasses the transition table.
    ///
    /// Reserved for exceptional recovery paths such as a hard reconnect;
    /// every use is logged because it breaks the formal transition contract.
    pub fn force_to(&mut self, state: S) {
        warn!(
            from = ?self.current,
            to = ?state,
            "forced state transition outside the registered table"
        );
        self.current = state;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
