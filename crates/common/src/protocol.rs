//! Signaling wire protocol between call clients and the relay.
//!
//! Every event travels as one JSON text frame:
//!
//! ```text
//! {"event": "participant-joined", "payload": {"callId": "...", "participant": {...}}}
//! ```
//!
//! Event names are kebab-case and payload fields camelCase. The `signal`
//! payload is an opaque negotiation blob; neither side interprets it.

use crate::error::ProtocolError;
use crate::types::{Call, CallId, CallParticipant, CallType, ChannelId, UserId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Announce presence for a user on this connection.
    Register { user_id: UserId },

    /// A call was created through the REST API; invite the listed users.
    CallStarted {
        call_id: CallId,
        channel_id: ChannelId,
        workspace_id: WorkspaceId,
        call_type: CallType,
        participants: Vec<UserId>,
    },

    /// The sender joined the call.
    JoinedCall { call_id: CallId },

    /// The sender left the call.
    LeftCall { call_id: CallId },

    /// The sender declined an incoming call.
    RejectCall { call_id: CallId },

    /// Negotiation data addressed to one member.
    Signal {
        to: UserId,
        signal: Value,
        call_id: CallId,
    },

    /// The sender's microphone was toggled.
    ToggleAudio { call_id: CallId, enabled: bool },

    /// The sender's camera was toggled.
    ToggleVideo { call_id: CallId, enabled: bool },

    /// The sender started sharing a screen.
    ScreenShareStarted { call_id: CallId },

    /// The sender stopped sharing a screen.
    ScreenShareEnded { call_id: CallId },
}

/// Events sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// The recipient was invited to a call.
    IncomingCall {
        call: Call,
        participants: Vec<UserId>,
    },

    /// An invitee joined the call (sent to the initiator).
    CallAccepted { call_id: CallId, user_id: UserId },

    /// An invitee declined the call.
    CallRejected { call_id: CallId, user_id: UserId },

    /// A member joined the call.
    ParticipantJoined {
        call_id: CallId,
        participant: CallParticipant,
    },

    /// A member left the call.
    ParticipantLeft { call_id: CallId, user_id: UserId },

    /// Negotiation data from one member.
    Signal {
        from: UserId,
        signal: Value,
        call_id: CallId,
    },

    /// A member toggled their microphone.
    ToggleAudio {
        call_id: CallId,
        user_id: UserId,
        enabled: bool,
    },

    /// A member toggled their camera.
    ToggleVideo {
        call_id: CallId,
        user_id: UserId,
        enabled: bool,
    },

    /// A member started sharing a screen.
    ScreenShareStarted { call_id: CallId, user_id: UserId },

    /// A member stopped sharing a screen.
    ScreenShareEnded { call_id: CallId, user_id: UserId },

    /// The call is over.
    CallEnded { call_id: CallId },

    /// Current roster, sent to a member that re-announces itself after a
    /// reconnect so it can catch up on joins and leaves it missed.
    CallRoster {
        call_id: CallId,
        participants: Vec<CallParticipant>,
    },

    /// The relay rejected a client event.
    Error { code: i32, message: String },
}

impl ClientEvent {
    /// Wire name of the event. Bounded set, safe as a metric label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register { .. } => "register",
            ClientEvent::CallStarted { .. } => "call-started",
            ClientEvent::JoinedCall { .. } => "joined-call",
            ClientEvent::LeftCall { .. } => "left-call",
            ClientEvent::RejectCall { .. } => "reject-call",
            ClientEvent::Signal { .. } => "signal",
            ClientEvent::ToggleAudio { .. } => "toggle-audio",
            ClientEvent::ToggleVideo { .. } => "toggle-video",
            ClientEvent::ScreenShareStarted { .. } => "screen-share-started",
            ClientEvent::ScreenShareEnded { .. } => "screen-share-ended",
        }
    }

    /// Whether the event changes who is in a call. These must reach the
    /// relay even when they were queued across a reconnect.
    #[must_use]
    pub const fn changes_membership(&self) -> bool {
        matches!(
            self,
            ClientEvent::CallStarted { .. }
                | ClientEvent::JoinedCall { .. }
                | ClientEvent::LeftCall { .. }
                | ClientEvent::RejectCall { .. }
        )
    }

    /// Call the event refers to, if any.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            ClientEvent::Register { .. } => None,
            ClientEvent::CallStarted { call_id, .. }
            | ClientEvent::JoinedCall { call_id }
            | ClientEvent::LeftCall { call_id }
            | ClientEvent::RejectCall { call_id }
            | ClientEvent::Signal { call_id, .. }
            | ClientEvent::ToggleAudio { call_id, .. }
            | ClientEvent::ToggleVideo { call_id, .. }
            | ClientEvent::ScreenShareStarted { call_id }
            | ClientEvent::ScreenShareEnded { call_id } => Some(*call_id),
        }
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerEvent {
    /// Wire name of the event. Bounded set, safe as a metric label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::IncomingCall { .. } => "incoming-call",
            ServerEvent::CallAccepted { .. } => "call-accepted",
            ServerEvent::CallRejected { .. } => "call-rejected",
            ServerEvent::ParticipantJoined { .. } => "participant-joined",
            ServerEvent::ParticipantLeft { .. } => "participant-left",
            ServerEvent::Signal { .. } => "signal",
            ServerEvent::ToggleAudio { .. } => "toggle-audio",
            ServerEvent::ToggleVideo { .. } => "toggle-video",
            ServerEvent::ScreenShareStarted { .. } => "screen-share-started",
            ServerEvent::ScreenShareEnded { .. } => "screen-share-ended",
            ServerEvent::CallEnded { .. } => "call-ended",
            ServerEvent::CallRoster { .. } => "call-roster",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Call the event refers to, if any.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            ServerEvent::IncomingCall { call, .. } => Some(call.id),
            ServerEvent::CallAccepted { call_id, .. }
            | ServerEvent::CallRejected { call_id, .. }
            | ServerEvent::ParticipantJoined { call_id, .. }
            | ServerEvent::ParticipantLeft { call_id, .. }
            | ServerEvent::Signal { call_id, .. }
            | ServerEvent::ToggleAudio { call_id, .. }
            | ServerEvent::ToggleVideo { call_id, .. }
            | ServerEvent::ScreenShareStarted { call_id, .. }
            | ServerEvent::ScreenShareEnded { call_id, .. }
            | ServerEvent::CallEnded { call_id }
            | ServerEvent::CallRoster { call_id, .. } => Some(*call_id),
            ServerEvent::Error { .. } => None,
        }
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}
