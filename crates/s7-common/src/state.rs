//! Connection state machine for one PLC link.
//!
//! State transitions follow the ISO-on-TCP handshake:
//! DISCONNECTED → CONNECTING → TCP_CONNECTED → NEGOTIATING → CONNECTED
//!
//! ERROR is reachable from every non-terminal state and leads back to
//! CONNECTING after the reconnect delay. Closing moves any state to
//! DISCONNECTED, which is terminal once the machine has been closed.

use crate::error::{S7Error, S7Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Connection states of a PLC link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport handle open.
    #[default]
    Disconnected,
    /// Transport connect issued, waiting for the socket.
    Connecting,
    /// TCP established, waiting for the RFC1006 connection.
    TcpConnected,
    /// RFC1006 established, negotiating the S7 PDU.
    TransportNegotiating,
    /// Fully connected; reads and writes are accepted.
    Connected,
    /// Link lost or connect failed; a reconnect is pending.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::TcpConnected => write!(f, "TCP_CONNECTED"),
            Self::TransportNegotiating => write!(f, "NEGOTIATING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl ConnectionState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::{
            Connected, Connecting, Disconnected, Error, TcpConnected, TransportNegotiating,
        };

        matches!(
            (self, target),
            // Handshake progression
            (Disconnected, Connecting)
                | (Connecting, TcpConnected)
                | (Connecting, TransportNegotiating)
                | (Connecting, Connected)
                | (TcpConnected, TransportNegotiating)
                | (TcpConnected, Connected)
                | (TransportNegotiating, Connected)
                // Failures
                | (Connecting, Error)
                | (TcpConnected, Error)
                | (TransportNegotiating, Error)
                | (Connected, Error)
                // Reconnect after the backoff delay
                | (Error, Connecting)
                // Close
                | (Connecting, Disconnected)
                | (TcpConnected, Disconnected)
                | (TransportNegotiating, Disconnected)
                | (Connected, Disconnected)
                | (Error, Disconnected)
        )
    }

    /// Returns true while a connect attempt is in progress.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::TcpConnected | Self::TransportNegotiating
        )
    }

    /// Coarse status shown to endpoints.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        match self {
            Self::Disconnected => LinkStatus::Disconnected,
            Self::Connecting | Self::TcpConnected | Self::TransportNegotiating => {
                LinkStatus::Connecting
            }
            Self::Connected => LinkStatus::Connected,
            Self::Error => LinkStatus::Error,
        }
    }
}

/// Coarse link status for UI and telemetry.
///
/// Purely informational: scheduling never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// Link is up.
    Connected,
    /// Handshake in progress.
    Connecting,
    /// No link and none pending.
    Disconnected,
    /// Link failed; reconnect pending.
    Error,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// State machine wrapper with transition history and a terminal close.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: ConnectionState,
    previous: Option<ConnectionState>,
    transition_count: u64,
    closed: bool,
}

impl StateMachine {
    /// Create a new state machine starting in DISCONNECTED.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<ConnectionState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Returns true once [`StateMachine::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: ConnectionState) -> S7Result<()> {
        if !self.closed && self.current.can_transition_to(target) {
            trace!(from = %self.current, to = %target, "state transition");
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            debug!(from = %self.current, to = %target, closed = self.closed, "state transition refused");
            Err(S7Error::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Force a transition to ERROR if the current state allows it.
    ///
    /// Returns true if the state changed.
    pub fn enter_error(&mut self) -> bool {
        self.transition(ConnectionState::Error).is_ok()
    }

    /// Move to DISCONNECTED and refuse every later transition.
    pub fn close(&mut self) {
        if self.current != ConnectionState::Disconnected {
            self.previous = Some(self.current);
            self.current = ConnectionState::Disconnected;
            self.transition_count += 1;
        }
        self.closed = true;
    }
}
