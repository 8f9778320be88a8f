//! Message types for actor communication.
//!
//! All inter-actor communication uses typed messages over `tokio::sync::mpsc`;
//! request-reply uses `tokio::sync::oneshot`.

use crate::errors::RelayError;

use super::call::CallActorHandle;
use super::connection::ConnectionActorHandle;

use common::protocol::{ClientEvent, ServerEvent};
use common::types::{Call, CallId, CallParticipant, CallType, ChannelId, UserId, WorkspaceId};
use tokio::sync::oneshot;

/// Messages sent to `RelayControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Bind a connection to a user. Replaces any older connection.
    Register {
        user_id: UserId,
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// A registered connection closed. Starts the disconnect grace period
    /// if it was still the user's current connection.
    ConnectionClosed {
        user_id: UserId,
        connection_id: String,
    },

    /// Create a call actor for a `call-started` event.
    CreateCall {
        request: NewCall,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Look up the actor for a live call.
    GetCall {
        call_id: CallId,
        respond_to: oneshot::Sender<Result<CallActorHandle, RelayError>>,
    },

    /// Current relay status.
    GetStatus {
        respond_to: oneshot::Sender<RelayStatus>,
    },

    /// Stop accepting calls and cancel all actors.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Fields of a `call-started` event plus the sender.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub call_id: CallId,
    pub initiator: UserId,
    pub channel_id: ChannelId,
    pub workspace_id: WorkspaceId,
    pub call_type: CallType,
    pub invitees: Vec<UserId>,
}

/// Messages sent to `CallActor`.
#[derive(Debug)]
pub enum CallMessage {
    /// A client event addressed to this call, from `user_id`.
    ClientEvent {
        user_id: UserId,
        event: ClientEvent,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// The user's disconnect grace period expired.
    MemberGone { user_id: UserId },

    /// Snapshot of call state.
    GetState {
        respond_to: oneshot::Sender<CallSnapshot>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Encode and write an event to the socket.
    Send { event: ServerEvent },

    /// Close the connection.
    Close { reason: String },
}

/// Relay status for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub call_count: usize,
    pub online_users: usize,
    pub disconnected_users: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Point-in-time view of one call.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call: Call,
    /// Roster in join order.
    pub members: Vec<CallParticipant>,
    /// Invitees that have neither joined nor rejected.
    pub pending: Vec<UserId>,
}

impl CallSnapshot {
    /// Member user ids in roster order.
    #[must_use]
    pub fn member_ids(&self) -> Vec<UserId> {
        self.members.iter().map(|m| m.user_id.clone()).collect()
    }
}
