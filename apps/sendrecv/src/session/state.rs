use std::fmt;

use crate::error::SessionError;

/// Coarse session lifecycle. Discriminants are grouped by phase so that the
/// ordering doubles as the "has progressed at least this far" check.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Unknown = 0,
    Error = 1,
    ServerConnecting = 1000,
    ServerConnectionError = 1001,
    ServerConnected = 1002,
    ServerRegistering = 2000,
    ServerRegistrationError = 2001,
    ServerRegistered = 2002,
    ServerClosed = 2003,
    PeerConnecting = 3000,
    PeerConnectionError = 3001,
    PeerConnected = 3002,
    PeerNegotiating = 4000,
    PeerCallStarted = 4001,
    PeerCallStopping = 4002,
    PeerCallStopped = 4003,
    PeerCallError = 4004,
}

impl SessionState {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            SessionState::Error
                | SessionState::ServerConnectionError
                | SessionState::ServerRegistrationError
                | SessionState::PeerConnectionError
                | SessionState::PeerCallError
        )
    }

    /// States that end the session when entered.
    pub fn is_sink(self) -> bool {
        self.is_error() || self == SessionState::ServerClosed
    }

    /// SDP and ICE may only be emitted once negotiation has begun.
    pub fn permits_peer_signaling(self) -> bool {
        self >= SessionState::PeerNegotiating
    }

    /// Maps a server-pushed `ERROR` line onto the error sink for the phase
    /// the session was in when it arrived.
    pub fn classify_server_error(self) -> SessionState {
        match self {
            SessionState::ServerConnecting => SessionState::ServerConnectionError,
            SessionState::ServerRegistering => SessionState::ServerRegistrationError,
            SessionState::PeerConnecting => SessionState::PeerConnectionError,
            SessionState::PeerConnected
            | SessionState::PeerNegotiating
            | SessionState::PeerCallStarted
            | SessionState::PeerCallStopping => SessionState::PeerCallError,
            _ => SessionState::Error,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionState::Unknown => "unknown",
            SessionState::Error => "error",
            SessionState::ServerConnecting => "server-connecting",
            SessionState::ServerConnectionError => "server-connection-error",
            SessionState::ServerConnected => "server-connected",
            SessionState::ServerRegistering => "server-registering",
            SessionState::ServerRegistrationError => "server-registration-error",
            SessionState::ServerRegistered => "server-registered",
            SessionState::ServerClosed => "server-closed",
            SessionState::PeerConnecting => "peer-connecting",
            SessionState::PeerConnectionError => "peer-connection-error",
            SessionState::PeerConnected => "peer-connected",
            SessionState::PeerNegotiating => "peer-negotiating",
            SessionState::PeerCallStarted => "peer-call-started",
            SessionState::PeerCallStopping => "peer-call-stopping",
            SessionState::PeerCallStopped => "peer-call-stopped",
            SessionState::PeerCallError => "peer-call-error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.code())
    }
}

#[derive(Debug)]
pub struct StateMachine {
    current: SessionState,
    history: Vec<SessionState>,
    reached_call: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: SessionState::Unknown,
            history: Vec::new(),
            reached_call: false,
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// True once the call was fully negotiated at some point.
    pub fn reached_call(&self) -> bool {
        self.reached_call
    }

    pub fn transition(&mut self, next: SessionState) -> SessionState {
        let previous = self.current;
        if previous != next {
            tracing::debug!(
                target = "sendrecv::state",
                from = %previous,
                to = %next,
                "session state transition"
            );
        }
        self.current = next;
        self.history.push(next);
        if next == SessionState::PeerCallStarted {
            self.reached_call = true;
        }
        previous
    }

    pub fn require(
        &self,
        predicate: impl FnOnce(SessionState) -> bool,
        action: &'static str,
    ) -> Result<(), SessionError> {
        if predicate(self.current) {
            Ok(())
        } else {
            Err(SessionError::AppStateViolation {
                action,
                state: self.current,
            })
        }
    }
}
