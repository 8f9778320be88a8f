//! Messages for the session actor.
//!
//! `SessionMessage` comes from `CallSessionHandle`; `InternalMessage` comes
//! back from tasks the actor spawned, tagged with the epoch they started in.

use crate::api::{JoinedCall, StartCallRequest};
use crate::errors::CallError;
use crate::media::{LocalMediaState, LocalStream, MediaTrack};

use super::state::SessionSnapshot;

use common::types::{Call, UserId};
use tokio::sync::oneshot;

/// Requests from the handle.
#[derive(Debug)]
pub enum SessionMessage {
    StartCall {
        request: StartCallRequest,
        respond_to: oneshot::Sender<Result<Call, CallError>>,
    },

    AcceptIncoming {
        respond_to: oneshot::Sender<Result<Call, CallError>>,
    },

    RejectIncoming {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    LeaveCall {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    ToggleAudio {
        respond_to: oneshot::Sender<LocalMediaState>,
    },

    ToggleVideo {
        respond_to: oneshot::Sender<LocalMediaState>,
    },

    StartScreenShare {
        respond_to: oneshot::Sender<Result<LocalMediaState, CallError>>,
    },

    StopScreenShare {
        respond_to: oneshot::Sender<LocalMediaState>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },

    /// Clean up and stop the actor.
    Dispose { respond_to: oneshot::Sender<()> },
}

/// Results of spawned work.
#[derive(Debug)]
pub(crate) enum InternalMessage {
    Completion { epoch: u64, outcome: Outcome },

    /// A shared screen track ended (locally or via the OS control).
    ScreenTrackEnded { track_id: String },
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Started(Result<StartedCall, CallError>),
    Joined(Result<AcceptedCall, CallError>),
    ScreenCaptured(Result<MediaTrack, CallError>),
}

/// Media plus the call the REST API created.
#[derive(Debug)]
pub(crate) struct StartedCall {
    pub stream: LocalStream,
    pub call: Call,
    pub invitees: Vec<UserId>,
}

/// Media plus the joined call and its roster.
#[derive(Debug)]
pub(crate) struct AcceptedCall {
    pub stream: LocalStream,
    pub joined: JoinedCall,
}
