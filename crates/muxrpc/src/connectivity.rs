//! Connectivity state machine for a single logical connection.
//!
//! ```text
//! idle --(call requested)--> connecting
//! connecting --(handshake succeeded)--> ready
//! connecting --(handshake failed)--> transient_failure
//! ready --(connection lost)--> transient_failure
//! transient_failure --(backoff elapsed)--> connecting
//! idle | connecting | ready | transient_failure --(close)--> shutdown
//! ```
//!
//! `shutdown` is terminal. The machine is pure: side effects such as
//! flushing the pending queue or scheduling a reconnect belong to the owner.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// No connection and none requested.
    #[default]
    Idle,
    /// A connect attempt is in progress.
    Connecting,
    /// A connection is established and accepting streams.
    Ready,
    /// The last attempt failed or the connection was lost; a reconnect is scheduled.
    TransientFailure,
    /// Closed for good.
    Shutdown,
}

impl ConnectivityState {
    /// Returns true for `Shutdown`.
    pub fn is_terminal(self) -> bool {
        self == ConnectivityState::Shutdown
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient_failure",
            ConnectivityState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Stimuli driving the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityEvent {
    /// A call needs a connection.
    CallRequested,
    /// Connect and handshake completed.
    HandshakeSucceeded,
    /// Connect or handshake failed.
    HandshakeFailed,
    /// The live connection was lost or failed keepalive.
    ConnectionLost,
    /// The reconnect backoff elapsed.
    BackoffElapsed,
    /// The owner requested an explicit close.
    CloseRequested,
}

/// An event that has no edge from the current state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no transition from {from} on {event:?}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: ConnectivityState,
    /// Rejected event.
    pub event: ConnectivityEvent,
}

/// Transition table. Returns `None` where no edge exists.
pub fn next_state(from: ConnectivityState, event: ConnectivityEvent) -> Option<ConnectivityState> {
    use ConnectivityEvent as E;
    use ConnectivityState as S;

    match (from, event) {
        (S::Shutdown, _) => None,
        (_, E::CloseRequested) => Some(S::Shutdown),
        (S::Idle, E::CallRequested) => Some(S::Connecting),
        (S::Connecting, E::HandshakeSucceeded) => Some(S::Ready),
        (S::Connecting, E::HandshakeFailed) => Some(S::TransientFailure),
        (S::Ready, E::ConnectionLost) => Some(S::TransientFailure),
        (S::TransientFailure, E::BackoffElapsed) => Some(S::Connecting),
        _ => None,
    }
}

/// Holds the current state and applies the transition table.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityStateMachine {
    state: ConnectivityState,
    transitions: u64,
}

impl ConnectivityStateMachine {
    /// Starts in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Number of transitions taken.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Applies an event, returning the new state.
    pub fn handle(&mut self, event: ConnectivityEvent) -> Result<ConnectivityState, InvalidTransition> {
        let next = next_state(self.state, event).ok_or(InvalidTransition {
            from: self.state,
            event,
        })?;
        self.state = next;
        self.transitions += 1;
        Ok(next)
    }
}
