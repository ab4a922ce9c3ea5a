//! Connection state machine.
//!
//! [`step`] is a pure function from the current state and an input to the
//! next state plus the effects the supervisor must perform. It never touches
//! a socket, so every transition can be tested directly.
//!
//! ```text
//!                 Start
//!  Disconnected ---------> Connecting <-------------------+
//!                           |   |  ^                      |
//!            ConnectFailed  |   |  | lost (no delay)      | BackoffElapsed
//!                           |   |  +----------+           |
//!                           v   v             |           |
//!            Failed <---- (classify) -----> Backoff ------+
//!                           ^
//!                           | SessionError
//!                       Connected
//! ```

use crate::config::ReconnectPolicy;
use crate::driver::{ErrorClass, StorageError};
use std::time::Duration;

/// State of one connection entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or removed
    Disconnected,
    /// Handshake in progress; `attempt` counts consecutive attempts
    Connecting { attempt: u32 },
    /// Session live and visible downstream
    Connected,
    /// Waiting `delay` before the next attempt
    Backoff { attempt: u32, delay: Duration },
    /// Given up; only reconfiguration brings the entry back
    Failed { error: StorageError },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Backoff { .. } => "backoff",
            ConnectionState::Failed { .. } => "failed",
        }
    }
}

/// Events driving the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Configuration added
    Start,
    ConnectSucceeded,
    ConnectFailed(StorageError),
    /// Live session broke
    SessionError(StorageError),
    BackoffElapsed,
    /// Configuration removed
    Remove,
}

/// Side effects requested by a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new session
    Connect,
    /// Make the session visible downstream
    Publish,
    /// Withdraw the session from downstream
    Revoke,
    /// Close the session
    Disconnect,
    /// Wait before the next attempt
    Schedule(Duration),
    /// Give up, recording the error
    Fail(StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ConnectionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: &ConnectionState) -> Self {
        Self::to(state.clone(), Vec::new())
    }
}

/// Compute the transition for `input` in `state`.
///
/// Inputs that do not apply to the current state leave it unchanged.
pub fn step(state: &ConnectionState, input: Input, policy: &ReconnectPolicy) -> Transition {
    use ConnectionState::*;

    match (state, input) {
        (Disconnected, Input::Start) => Transition::to(Connecting { attempt: 1 }, vec![Effect::Connect]),

        (Connecting { .. }, Input::ConnectSucceeded) => {
            Transition::to(Connected, vec![Effect::Publish])
        }

        (Connecting { attempt }, Input::ConnectFailed(error)) => {
            retry(*attempt, error, Vec::new(), policy)
        }

        // Visibility goes first, then the error is classified like a failed handshake.
        (Connected, Input::SessionError(error)) => {
            retry(0, error, vec![Effect::Revoke, Effect::Disconnect], policy)
        }

        (Backoff { attempt, .. }, Input::BackoffElapsed) => Transition::to(
            Connecting {
                attempt: attempt.saturating_add(1),
            },
            vec![Effect::Connect],
        ),

        (Connected, Input::Remove) => {
            Transition::to(Disconnected, vec![Effect::Revoke, Effect::Disconnect])
        }
        (_, Input::Remove) => Transition::to(Disconnected, Vec::new()),

        (state, _) => Transition::stay(state),
    }
}

/// Classify `error` after `attempt` consecutive failed attempts.
fn retry(
    attempt: u32,
    error: StorageError,
    mut effects: Vec<Effect>,
    policy: &ReconnectPolicy,
) -> Transition {
    let class = error.class();
    let delay = match policy.delay(class) {
        Some(delay) if policy.allows_retry(attempt) => delay,
        _ => {
            effects.push(Effect::Fail(error.clone()));
            return Transition::to(ConnectionState::Failed { error }, effects);
        }
    };

    if class == ErrorClass::ConnectionLost || delay.is_zero() {
        effects.push(Effect::Connect);
        return Transition::to(
            ConnectionState::Connecting {
                attempt: attempt.saturating_add(1),
            },
            effects,
        );
    }

    effects.push(Effect::Schedule(delay));
    Transition::to(ConnectionState::Backoff { attempt, delay }, effects)
}
