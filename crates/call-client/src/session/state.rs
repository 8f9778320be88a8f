//! Session state, notices and the read model.

use crate::errors::CallError;
use crate::media::{LocalMediaState, RemoteStream};

use common::types::{Call, CallId, CallParticipant, UserId};
use std::fmt;
use std::time::Duration;

/// Default time a call survives a dropped signaling connection.
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(30);

/// Where the local user stands with respect to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Started a call; nobody has joined yet.
    Outgoing,
    /// Invited; not yet accepted or rejected.
    Incoming,
    Active,
}

impl CallState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "outgoing",
            CallState::Incoming => "incoming",
            CallState::Active => "active",
        }
    }

    /// Whether the local user is a member of a call (holds media).
    #[must_use]
    pub const fn in_call(&self) -> bool {
        matches!(self, CallState::Outgoing | CallState::Active)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a call is kept after signaling drops.
    pub reconnect_grace: Duration,
    /// Unanswered outgoing calls end after this long. `None` waits forever.
    pub outgoing_call_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            outgoing_call_timeout: None,
        }
    }
}

/// Why a call ended locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `leave_call`.
    Left,
    /// `reject_incoming_call`.
    Rejected,
    /// The relay sent `call-ended`.
    EndedByServer,
    /// Nobody answered before the outgoing timeout.
    TimedOut,
    /// Signaling stayed down past the reconnect grace.
    SignalingLost,
    /// The session was disposed.
    Disposed,
}

/// UI-facing notifications.
#[derive(Debug, Clone)]
pub enum CallNotice {
    StateChanged {
        state: CallState,
    },
    IncomingCall {
        call: Call,
        participants: Vec<UserId>,
    },
    /// An invitation arrived while busy and was declined.
    MissedCall {
        call: Call,
    },
    InviteAccepted {
        user_id: UserId,
    },
    InviteRejected {
        user_id: UserId,
    },
    ParticipantJoined {
        participant: CallParticipant,
    },
    ParticipantLeft {
        user_id: UserId,
    },
    /// A member toggled audio, video or screen share.
    ParticipantMediaChanged {
        participant: CallParticipant,
    },
    RemoteStreamAdded {
        user_id: UserId,
        stream: RemoteStream,
    },
    /// One peer failed. The call continues.
    PeerConnectionFailed {
        error: CallError,
    },
    SignalingLost,
    SignalingRestored,
    CallEnded {
        call_id: CallId,
        reason: EndReason,
    },
    /// The relay rejected an event.
    RelayError {
        code: i32,
        message: String,
    },
}

/// One peer connection as seen from the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub user_id: UserId,
    pub initiator: bool,
    pub connected: bool,
    pub has_remote_stream: bool,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub user_id: UserId,
    pub state: CallState,
    /// The current call, or the pending invitation while `Incoming`.
    pub call: Option<Call>,
    /// Members, including the local user once joined.
    pub roster: Vec<CallParticipant>,
    /// Invitees that have not answered (outgoing calls).
    pub pending_invitees: Vec<UserId>,
    pub media: LocalMediaState,
    /// Sorted by user id.
    pub peers: Vec<PeerSummary>,
    /// A start or accept is waiting on media or the call API.
    pub transition_in_flight: bool,
    /// Inbound events held until the transition settles.
    pub deferred_events: usize,
    pub signaling_connected: bool,
}

impl SessionSnapshot {
    #[must_use]
    pub fn peer(&self, user_id: &UserId) -> Option<&PeerSummary> {
        self.peers.iter().find(|p| &p.user_id == user_id)
    }

    #[must_use]
    pub fn roster_ids(&self) -> Vec<UserId> {
        self.roster.iter().map(|p| p.user_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(CallState::Idle.to_string(), "idle");
        assert_eq!(CallState::Outgoing.to_string(), "outgoing");
        assert_eq!(CallState::Incoming.to_string(), "incoming");
        assert_eq!(CallState::Active.to_string(), "active");
    }

    #[test]
    fn test_in_call() {
        assert!(CallState::Outgoing.in_call());
        assert!(CallState::Active.in_call());
        assert!(!CallState::Incoming.in_call());
        assert!(!CallState::Idle.in_call());
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.reconnect_grace, Duration::from_secs(30));
        assert!(config.outgoing_call_timeout.is_none());
    }
}
