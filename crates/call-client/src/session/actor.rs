//! `CallSessionActor` - one per local user.
//!
//! Owns the call state, the `MediaDeviceController` and the
//! `PeerConnectionPool`. Media capture and REST calls run on spawned tasks
//! and report back as `Completion`s tagged with the epoch they started in;
//! any cleanup bumps the epoch, so a completion that arrives after a leave is
//! recognised as stale and its resources are released.
//!
//! While a start or accept is in flight, inbound server events are queued
//! and replayed in order once the transition settles.

use crate::api::{CallApi, StartCallRequest};
use crate::errors::CallError;
use crate::media::{
    LocalMediaState, LocalStream, MediaDeviceController, MediaDevices, MediaTrack,
};
use crate::peer::{PeerConnectionFactory, PeerConnectionPool, PeerEventEnvelope, PeerOutcome};
use crate::signaling::{ChannelEvent, SignalingChannel};

use super::messages::{AcceptedCall, InternalMessage, Outcome, SessionMessage, StartedCall};
use super::state::{
    CallNotice, CallState, EndReason, PeerSummary, SessionConfig, SessionSnapshot,
};

use common::protocol::{ClientEvent, ServerEvent};
use common::types::{Call, CallId, CallParticipant, UserId};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Capacity of the notice broadcast. Slow subscribers see `Lagged`.
const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Collaborators the session drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn CallApi>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

/// Handle to a `CallSessionActor`.
#[derive(Clone, Debug)]
pub struct CallSessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    notices: broadcast::Sender<CallNotice>,
    cancel_token: CancellationToken,
    user_id: UserId,
}

impl CallSessionHandle {
    /// Spawn the session actor for `user_id` and register with signaling.
    #[must_use]
    pub fn spawn(
        user_id: UserId,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let channel_events = deps.signaling.subscribe();
        deps.signaling.register(user_id.clone());

        let actor = CallSessionActor {
            user_id: user_id.clone(),
            config,
            api: deps.api,
            signaling: deps.signaling,
            media: MediaDeviceController::new(deps.media),
            peers: PeerConnectionPool::new(deps.peers, peer_tx),
            receiver,
            channel_events,
            channel_open: true,
            peer_events,
            internal_tx,
            internal_rx,
            notices: notices.clone(),
            cancel_token: cancel_token.clone(),
            state: CallState::Idle,
            call: None,
            roster: Vec::new(),
            pending: Vec::new(),
            epoch: 0,
            in_flight: None,
            screen_request: None,
            deferred: VecDeque::new(),
            signaling_connected: true,
            outgoing_deadline: None,
            reconnect_deadline: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = Self {
            sender,
            notices,
            cancel_token,
            user_id,
        };

        (handle, task_handle)
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Receive notices from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    /// Start a call: capture media, create the call through the REST API and
    /// invite `request.participants`.
    ///
    /// # Errors
    ///
    /// - `CallError::InvalidState` unless idle
    /// - `CallError::MediaAccessDenied`, `CallError::Api` from capture or the
    ///   API; nothing is retained
    /// - `CallError::Cancelled` if `leave_call` runs first
    pub async fn start_call(&self, request: StartCallRequest) -> Result<Call, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::StartCall {
            request,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Accept the pending invitation.
    ///
    /// # Errors
    ///
    /// - `CallError::InvalidState` unless an invitation is pending
    /// - `CallError::MediaAccessDenied` (the invitation is declined),
    ///   `CallError::CallNotFound`, `CallError::Api`
    /// - `CallError::Cancelled` if `leave_call` runs first
    pub async fn accept_incoming_call(&self) -> Result<Call, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::AcceptIncoming { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Decline the pending invitation.
    pub async fn reject_incoming_call(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::RejectIncoming { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the current call (or decline a pending invitation, or cancel a
    /// start in progress). Local cleanup is complete when this returns; the
    /// result reflects the REST leave.
    pub async fn leave_call(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::LeaveCall { respond_to: tx }).await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn toggle_audio(&self) -> Result<LocalMediaState, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::ToggleAudio { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn toggle_video(&self) -> Result<LocalMediaState, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::ToggleVideo { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Share a screen in place of the camera on every peer.
    pub async fn start_screen_share(&self) -> Result<LocalMediaState, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::StartScreenShare { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn stop_screen_share(&self) -> Result<LocalMediaState, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::StopScreenShare { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetSnapshot { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Leave any call, release media and stop the actor. Idempotent.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionMessage::Dispose { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.cancel_token.cancel();
    }

    async fn send(&self, message: SessionMessage) -> Result<(), CallError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }
}

/// A start or accept waiting on spawned work.
enum Transition {
    Start {
        respond_to: oneshot::Sender<Result<Call, CallError>>,
    },
    Accept {
        call_id: CallId,
        respond_to: oneshot::Sender<Result<Call, CallError>>,
    },
}

struct CallSessionActor {
    user_id: UserId,
    config: SessionConfig,
    api: Arc<dyn CallApi>,
    signaling: Arc<dyn SignalingChannel>,
    media: MediaDeviceController,
    peers: PeerConnectionPool,
    receiver: mpsc::Receiver<SessionMessage>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    channel_open: bool,
    peer_events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    internal_tx: mpsc::UnboundedSender<InternalMessage>,
    internal_rx: mpsc::UnboundedReceiver<InternalMessage>,
    notices: broadcast::Sender<CallNotice>,
    cancel_token: CancellationToken,

    state: CallState,
    /// Current call, or the invitation while `Incoming`.
    call: Option<Call>,
    roster: Vec<CallParticipant>,
    /// Invitees that have not answered.
    pending: Vec<UserId>,
    epoch: u64,
    in_flight: Option<Transition>,
    screen_request: Option<oneshot::Sender<Result<LocalMediaState, CallError>>>,
    deferred: VecDeque<ServerEvent>,
    signaling_connected: bool,
    outgoing_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
}

impl CallSessionActor {
    #[instrument(skip_all, name = "client.session", fields(user_id = %self.user_id))]
    async fn run(mut self) {
        debug!(target: "client.session", user_id = %self.user_id, "Session started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "client.session",
                        user_id = %self.user_id,
                        "Session received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(target: "client.session", "All handles dropped");
                        break;
                    };
                    if self.handle_message(message) {
                        break;
                    }
                }

                event = self.channel_events.recv(), if self.channel_open => {
                    match event {
                        Some(event) => self.handle_channel_event(event),
                        None => {
                            warn!(target: "client.session", "Signaling subscription closed");
                            self.channel_open = false;
                        }
                    }
                }

                Some(envelope) = self.peer_events.recv() => {
                    self.handle_peer_event(envelope);
                }

                Some(message) = self.internal_rx.recv() => {
                    self.handle_internal(message);
                }

                () = sleep_until_opt(self.outgoing_deadline) => {
                    self.outgoing_deadline = None;
                    if self.state == CallState::Outgoing {
                        info!(target: "client.session", "Outgoing call unanswered, ending");
                        if let Some(call_id) = self.abandon(EndReason::TimedOut) {
                            self.spawn_best_effort_leave(call_id);
                        }
                    }
                }

                () = sleep_until_opt(self.reconnect_deadline) => {
                    self.reconnect_deadline = None;
                    warn!(target: "client.session", "Signaling did not recover, ending call");
                    if let Some(call_id) = self.abandon(EndReason::SignalingLost) {
                        self.spawn_best_effort_leave(call_id);
                    }
                }
            }

            self.replay_deferred();
        }

        if let Some(call_id) = self.abandon(EndReason::Disposed) {
            self.spawn_best_effort_leave(call_id);
        }
        self.deferred.clear();

        debug!(target: "client.session", user_id = %self.user_id, "Session stopped");
    }

    /// Returns true when the actor should exit.
    fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::StartCall {
                request,
                respond_to,
            } => self.begin_start(request, respond_to),

            SessionMessage::AcceptIncoming { respond_to } => self.begin_accept(respond_to),

            SessionMessage::RejectIncoming { respond_to } => {
                let result = if self.state == CallState::Incoming {
                    self.abandon(EndReason::Rejected);
                    Ok(())
                } else {
                    Err(CallError::InvalidState {
                        operation: "reject a call",
                        state: self.state,
                    })
                };
                let _ = respond_to.send(result);
            }

            SessionMessage::LeaveCall { respond_to } => match self.abandon(EndReason::Left) {
                Some(call_id) => {
                    let api = Arc::clone(&self.api);
                    tokio::spawn(async move {
                        let _ = respond_to.send(api.leave_call(call_id).await);
                    });
                }
                None => {
                    let _ = respond_to.send(Ok(()));
                }
            },

            SessionMessage::ToggleAudio { respond_to } => {
                let state = self.media.toggle_audio();
                if state.has_stream {
                    self.emit_in_call(|call_id| ClientEvent::ToggleAudio {
                        call_id,
                        enabled: state.audio_enabled,
                    });
                }
                let _ = respond_to.send(state);
            }

            SessionMessage::ToggleVideo { respond_to } => {
                let state = self.media.toggle_video();
                if state.has_stream {
                    self.emit_in_call(|call_id| ClientEvent::ToggleVideo {
                        call_id,
                        enabled: state.video_enabled,
                    });
                }
                let _ = respond_to.send(state);
            }

            SessionMessage::StartScreenShare { respond_to } => {
                self.begin_screen_capture(respond_to);
            }

            SessionMessage::StopScreenShare { respond_to } => {
                let state = self.stop_screen_share();
                let _ = respond_to.send(state);
            }

            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            SessionMessage::Dispose { respond_to } => {
                info!(target: "client.session", user_id = %self.user_id, "Session disposed");
                if let Some(call_id) = self.abandon(EndReason::Disposed) {
                    self.spawn_best_effort_leave(call_id);
                }
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    // --- Transitions -----------------------------------------------------

    fn begin_start(
        &mut self,
        request: StartCallRequest,
        respond_to: oneshot::Sender<Result<Call, CallError>>,
    ) {
        if self.state != CallState::Idle || self.in_flight.is_some() {
            let _ = respond_to.send(Err(CallError::InvalidState {
                operation: "start a call",
                state: self.state,
            }));
            return;
        }

        info!(
            target: "client.session",
            call_type = request.call_type.as_str(),
            invitees = request.participants.len(),
            "Starting call"
        );

        let media = self.media.request(request.call_type);
        let api = Arc::clone(&self.api);
        self.spawn_completion(async move {
            Outcome::Started(start_call_task(media, api, request).await)
        });
        self.in_flight = Some(Transition::Start { respond_to });
    }

    fn begin_accept(&mut self, respond_to: oneshot::Sender<Result<Call, CallError>>) {
        let Some(call) = self
            .call
            .as_ref()
            .filter(|_| self.state == CallState::Incoming && self.in_flight.is_none())
        else {
            let _ = respond_to.send(Err(CallError::InvalidState {
                operation: "accept a call",
                state: self.state,
            }));
            return;
        };

        let call_id = call.id;
        info!(target: "client.session", call_id = %call_id, "Accepting call");

        let media = self.media.request(call.call_type);
        let api = Arc::clone(&self.api);
        self.spawn_completion(async move {
            Outcome::Joined(accept_call_task(media, api, call_id).await)
        });
        self.in_flight = Some(Transition::Accept {
            call_id,
            respond_to,
        });
    }

    fn handle_internal(&mut self, message: InternalMessage) {
        match message {
            InternalMessage::Completion { epoch, outcome } => {
                if epoch != self.epoch {
                    self.discard_stale(outcome);
                    return;
                }
                match (outcome, self.in_flight.take()) {
                    (Outcome::Started(result), Some(Transition::Start { respond_to })) => {
                        let reply = self.complete_start(result);
                        let _ = respond_to.send(reply);
                    }
                    (Outcome::Joined(result), Some(Transition::Accept { call_id, respond_to })) => {
                        let reply = self.complete_accept(call_id, result);
                        let _ = respond_to.send(reply);
                    }
                    (Outcome::ScreenCaptured(result), in_flight) => {
                        self.in_flight = in_flight;
                        self.complete_screen_capture(result);
                    }
                    (outcome, in_flight) => {
                        warn!(target: "client.session", "Completion does not match transition");
                        self.in_flight = in_flight;
                        self.discard_stale(outcome);
                    }
                }
            }

            InternalMessage::ScreenTrackEnded { track_id } => {
                if self.media.screen_track().is_some_and(|t| t.id() == track_id) {
                    info!(target: "client.session", track_id = %track_id, "Screen share ended by platform");
                    self.stop_screen_share();
                }
            }
        }
    }

    fn complete_start(&mut self, result: Result<StartedCall, CallError>) -> Result<Call, CallError> {
        let StartedCall {
            stream,
            call,
            invitees,
        } = result.inspect_err(|e| {
            warn!(target: "client.session", error = %e, "Start call failed");
        })?;

        self.media.install(stream);
        self.roster = vec![CallParticipant::joined_now(self.user_id.clone())];
        self.pending = dedup_invitees(invitees, &self.user_id);
        self.call = Some(call.clone());

        self.signaling.send(ClientEvent::CallStarted {
            call_id: call.id,
            channel_id: call.channel_id.clone(),
            workspace_id: call.workspace_id.clone(),
            call_type: call.call_type,
            participants: self.pending.clone(),
        });

        self.outgoing_deadline = self
            .config
            .outgoing_call_timeout
            .map(|timeout| Instant::now() + timeout);
        self.set_state(CallState::Outgoing);

        info!(
            target: "client.session",
            call_id = %call.id,
            pending = self.pending.len(),
            "Call started"
        );
        Ok(call)
    }

    fn complete_accept(
        &mut self,
        call_id: CallId,
        result: Result<AcceptedCall, CallError>,
    ) -> Result<Call, CallError> {
        let AcceptedCall { stream, joined } = match result {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(target: "client.session", call_id = %call_id, error = %e, "Accept failed");
                if !matches!(e, CallError::CallNotFound(_)) {
                    self.signaling.send(ClientEvent::RejectCall { call_id });
                }
                self.cleanup(EndReason::Rejected);
                return Err(e);
            }
        };

        self.media.install(stream);
        let call = joined.call;
        self.call = Some(call.clone());
        self.roster = joined.participants;
        if !self.roster.iter().any(|p| p.user_id == self.user_id) {
            self.roster
                .push(CallParticipant::joined_now(self.user_id.clone()));
        }

        self.signaling.send(ClientEvent::JoinedCall { call_id: call.id });
        self.set_state(CallState::Active);

        let others: Vec<UserId> = self
            .roster
            .iter()
            .map(|p| p.user_id.clone())
            .filter(|u| u != &self.user_id)
            .collect();
        for user_id in others {
            self.connect_peer(user_id);
        }

        info!(
            target: "client.session",
            call_id = %call.id,
            members = self.roster.len(),
            "Call joined"
        );
        Ok(call)
    }

    /// Release what a completion from an abandoned transition acquired.
    fn discard_stale(&self, outcome: Outcome) {
        match outcome {
            Outcome::Started(Ok(started)) => {
                debug!(target: "client.session", call_id = %started.call.id, "Discarding stale start");
                started.stream.stop_all();
                self.spawn_best_effort_leave(started.call.id);
            }
            Outcome::Joined(Ok(accepted)) => {
                debug!(
                    target: "client.session",
                    call_id = %accepted.joined.call.id,
                    "Discarding stale join"
                );
                accepted.stream.stop_all();
                self.spawn_best_effort_leave(accepted.joined.call.id);
            }
            Outcome::ScreenCaptured(Ok(track)) => track.stop(),
            Outcome::Started(Err(_)) | Outcome::Joined(Err(_)) | Outcome::ScreenCaptured(Err(_)) => {}
        }
    }

    /// Leave whatever the session is doing and clean up.
    ///
    /// Returns the call to leave through the REST API, if the local user is
    /// a member of one.
    fn abandon(&mut self, reason: EndReason) -> Option<CallId> {
        if let Some(transition) = self.in_flight.take() {
            match transition {
                Transition::Start { respond_to } => {
                    let _ = respond_to.send(Err(CallError::Cancelled));
                }
                Transition::Accept {
                    call_id,
                    respond_to,
                } => {
                    self.signaling.send(ClientEvent::RejectCall { call_id });
                    let _ = respond_to.send(Err(CallError::Cancelled));
                }
            }
            debug!(target: "client.session", reason = ?reason, "In-flight transition cancelled");
            self.cleanup(reason);
            return None;
        }

        match self.state {
            CallState::Idle => None,
            CallState::Incoming => {
                if let Some(call) = &self.call {
                    self.signaling.send(ClientEvent::RejectCall { call_id: call.id });
                }
                self.cleanup(reason);
                None
            }
            CallState::Outgoing | CallState::Active => {
                let call_id = self.call.as_ref().map(|c| c.id);
                if let Some(call_id) = call_id {
                    self.signaling.send(ClientEvent::LeftCall { call_id });
                }
                self.cleanup(reason);
                call_id
            }
        }
    }

    /// Tear down peers and media and return to `Idle`. Idempotent.
    fn cleanup(&mut self, reason: EndReason) {
        self.peers.destroy_all();
        self.media.release();
        self.epoch += 1;
        self.outgoing_deadline = None;
        self.reconnect_deadline = None;
        self.roster.clear();
        self.pending.clear();

        if let Some(respond_to) = self.screen_request.take() {
            let _ = respond_to.send(Err(CallError::Cancelled));
        }

        let call = self.call.take();
        if self.state == CallState::Idle {
            return;
        }

        if let Some(call) = call {
            info!(
                target: "client.session",
                call_id = %call.id,
                reason = ?reason,
                "Call ended"
            );
            self.notify(CallNotice::CallEnded {
                call_id: call.id,
                reason,
            });
        }
        self.set_state(CallState::Idle);
    }

    // --- Inbound events --------------------------------------------------

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(event) => {
                if self.in_flight.is_some() {
                    debug!(
                        target: "client.session",
                        event = event.name(),
                        "Deferring event during transition"
                    );
                    self.deferred.push_back(event);
                } else {
                    self.handle_server_event(event);
                }
            }

            ChannelEvent::Disconnected => {
                self.signaling_connected = false;
                if self.state != CallState::Idle || self.in_flight.is_some() {
                    warn!(
                        target: "client.session",
                        grace_secs = self.config.reconnect_grace.as_secs(),
                        "Signaling lost during call"
                    );
                    self.reconnect_deadline = Some(Instant::now() + self.config.reconnect_grace);
                }
                self.notify(CallNotice::SignalingLost);
            }

            ChannelEvent::Reconnected => {
                self.signaling_connected = true;
                self.reconnect_deadline = None;
                // The relay answers with `call-roster`, or `call-ended` if
                // the call is gone
                if self.state.in_call() {
                    if let Some(call) = &self.call {
                        info!(target: "client.session", call_id = %call.id, "Rejoining after reconnect");
                        self.signaling.send(ClientEvent::JoinedCall { call_id: call.id });
                    }
                }
                self.notify(CallNotice::SignalingRestored);
            }
        }
    }

    fn replay_deferred(&mut self) {
        while self.in_flight.is_none() {
            let Some(event) = self.deferred.pop_front() else {
                break;
            };
            debug!(target: "client.session", event = event.name(), "Replaying deferred event");
            self.handle_server_event(event);
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        if let ServerEvent::IncomingCall { call, participants } = event {
            self.handle_incoming_call(call, participants);
            return;
        }
        if let ServerEvent::Error { code, message } = event {
            warn!(target: "client.session", code, message = %message, "Relay rejected event");
            self.notify(CallNotice::RelayError { code, message });
            return;
        }

        let current = self.call.as_ref().map(|c| c.id);
        if event.call_id().is_none() || event.call_id() != current {
            debug!(
                target: "client.session",
                event = event.name(),
                "Event for another call ignored"
            );
            return;
        }

        match event {
            ServerEvent::CallEnded { .. } => {
                self.cleanup(EndReason::EndedByServer);
            }

            ServerEvent::CallAccepted { user_id, .. } => {
                self.pending.retain(|u| u != &user_id);
                self.notify(CallNotice::InviteAccepted { user_id });
            }

            ServerEvent::CallRejected { user_id, .. } => {
                self.pending.retain(|u| u != &user_id);
                self.notify(CallNotice::InviteRejected { user_id });
            }

            ServerEvent::ParticipantJoined { participant, .. } if self.state.in_call() => {
                self.handle_participant_joined(participant);
            }

            ServerEvent::ParticipantLeft { user_id, .. } if self.state.in_call() => {
                self.roster.retain(|p| p.user_id != user_id);
                self.peers.destroy(&user_id);
                info!(target: "client.session", user_id = %user_id, "Participant left");
                self.notify(CallNotice::ParticipantLeft { user_id });
            }

            ServerEvent::CallRoster { participants, .. } if self.state.in_call() => {
                self.reconcile_roster(participants);
            }

            ServerEvent::Signal { from, signal, .. } if self.state.in_call() => {
                if from == self.user_id {
                    return;
                }
                if let Err(error) = self.peers.signal(&from, signal, &self.media) {
                    self.notify(CallNotice::PeerConnectionFailed { error });
                }
            }

            ServerEvent::ToggleAudio {
                user_id, enabled, ..
            } => self.update_participant(&user_id, |p| p.audio_enabled = enabled),

            ServerEvent::ToggleVideo {
                user_id, enabled, ..
            } => self.update_participant(&user_id, |p| p.video_enabled = enabled),

            ServerEvent::ScreenShareStarted { user_id, .. } => {
                self.update_participant(&user_id, |p| p.screen_sharing = true);
            }

            ServerEvent::ScreenShareEnded { user_id, .. } => {
                self.update_participant(&user_id, |p| p.screen_sharing = false);
            }

            other => {
                debug!(
                    target: "client.session",
                    event = other.name(),
                    state = %self.state,
                    "Event not applicable in current state"
                );
            }
        }
    }

    fn handle_incoming_call(&mut self, call: Call, participants: Vec<UserId>) {
        if self.call.as_ref().is_some_and(|c| c.id == call.id) {
            debug!(target: "client.session", call_id = %call.id, "Duplicate invitation ignored");
            return;
        }

        if self.state != CallState::Idle {
            info!(
                target: "client.session",
                call_id = %call.id,
                state = %self.state,
                "Busy, declining invitation"
            );
            self.signaling.send(ClientEvent::RejectCall { call_id: call.id });
            self.notify(CallNotice::MissedCall { call });
            return;
        }

        info!(
            target: "client.session",
            call_id = %call.id,
            initiator = %call.initiator,
            call_type = call.call_type.as_str(),
            "Incoming call"
        );
        self.call = Some(call.clone());
        self.set_state(CallState::Incoming);
        self.notify(CallNotice::IncomingCall { call, participants });
    }

    fn handle_participant_joined(&mut self, participant: CallParticipant) {
        let user_id = participant.user_id.clone();
        if user_id == self.user_id {
            return;
        }

        self.pending.retain(|u| u != &user_id);
        match self.roster.iter_mut().find(|p| p.user_id == user_id) {
            Some(existing) => *existing = participant.clone(),
            None => self.roster.push(participant.clone()),
        }
        info!(
            target: "client.session",
            user_id = %user_id,
            members = self.roster.len(),
            "Participant joined"
        );

        if self.state == CallState::Outgoing {
            self.outgoing_deadline = None;
            self.set_state(CallState::Active);
        }

        self.notify(CallNotice::ParticipantJoined { participant });
        self.connect_peer(user_id);
    }

    /// Catch up on joins and leaves missed while signaling was down.
    fn reconcile_roster(&mut self, participants: Vec<CallParticipant>) {
        let gone: Vec<UserId> = self
            .roster
            .iter()
            .map(|p| p.user_id.clone())
            .filter(|u| u != &self.user_id && !participants.iter().any(|p| &p.user_id == u))
            .collect();
        for user_id in gone {
            self.roster.retain(|p| p.user_id != user_id);
            self.peers.destroy(&user_id);
            info!(target: "client.session", user_id = %user_id, "Participant left while disconnected");
            self.notify(CallNotice::ParticipantLeft { user_id });
        }

        for participant in participants {
            if participant.user_id == self.user_id {
                continue;
            }
            match self.roster.iter_mut().find(|p| p.user_id == participant.user_id) {
                Some(existing) => *existing = participant,
                None => self.handle_participant_joined(participant),
            }
        }
    }

    fn update_participant(&mut self, user_id: &UserId, apply: impl FnOnce(&mut CallParticipant)) {
        let Some(participant) = self.roster.iter_mut().find(|p| &p.user_id == user_id) else {
            debug!(target: "client.session", user_id = %user_id, "Media update for non-member ignored");
            return;
        };
        apply(participant);
        let participant = participant.clone();
        self.notify(CallNotice::ParticipantMediaChanged { participant });
    }

    fn handle_peer_event(&mut self, envelope: PeerEventEnvelope) {
        match self.peers.handle_event(envelope) {
            PeerOutcome::Ignored => {}
            PeerOutcome::Outbound { to, signal } => {
                self.emit_in_call(|call_id| ClientEvent::Signal {
                    to,
                    signal,
                    call_id,
                });
            }
            PeerOutcome::StreamAdded(user_id) => {
                if let Some(stream) = self.peers.remote_stream(&user_id).cloned() {
                    self.notify(CallNotice::RemoteStreamAdded { user_id, stream });
                }
            }
            PeerOutcome::Connected(user_id) => {
                debug!(target: "client.session", user_id = %user_id, "Peer connected");
            }
            PeerOutcome::Closed(user_id) => {
                debug!(target: "client.session", user_id = %user_id, "Peer closed");
            }
            PeerOutcome::Failed(error) => {
                self.notify(CallNotice::PeerConnectionFailed { error });
            }
        }
    }

    // --- Screen share ----------------------------------------------------

    fn begin_screen_capture(
        &mut self,
        respond_to: oneshot::Sender<Result<LocalMediaState, CallError>>,
    ) {
        if !self.state.in_call() || self.screen_request.is_some() {
            let _ = respond_to.send(Err(CallError::InvalidState {
                operation: "share a screen",
                state: self.state,
            }));
            return;
        }

        let capture = self.media.request_display();
        self.spawn_completion(async move { Outcome::ScreenCaptured(capture.await) });
        self.screen_request = Some(respond_to);
    }

    fn complete_screen_capture(&mut self, result: Result<MediaTrack, CallError>) {
        let Some(respond_to) = self.screen_request.take() else {
            if let Ok(track) = result {
                track.stop();
            }
            return;
        };

        let reply = result
            .and_then(|track| self.media.begin_screen_share(track, &mut self.peers))
            .map(|track| {
                self.watch_screen_track(track);
                self.emit_in_call(|call_id| ClientEvent::ScreenShareStarted { call_id });
                self.media.state()
            });
        let _ = respond_to.send(reply);
    }

    fn stop_screen_share(&mut self) -> LocalMediaState {
        if !self.media.is_sharing() {
            return self.media.state();
        }
        let state = self.media.stop_screen_share(&mut self.peers);
        self.emit_in_call(|call_id| ClientEvent::ScreenShareEnded { call_id });
        state
    }

    /// Report the OS "stop sharing" control back into the mailbox.
    fn watch_screen_track(&self, track: MediaTrack) {
        let tx = self.internal_tx.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {}
                () = track.ended() => {
                    let _ = tx.send(InternalMessage::ScreenTrackEnded {
                        track_id: track.id().to_string(),
                    });
                }
            }
        });
    }

    // --- Helpers ---------------------------------------------------------

    fn connect_peer(&mut self, user_id: UserId) {
        let created = self.peers.create(user_id, true, &self.media).map(|_| ());
        if let Err(error) = created {
            self.notify(CallNotice::PeerConnectionFailed { error });
        }
    }

    fn spawn_completion<F>(&self, work: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let outcome = work.await;
            let _ = tx.send(InternalMessage::Completion { epoch, outcome });
        });
    }

    fn spawn_best_effort_leave(&self, call_id: CallId) {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(e) = api.leave_call(call_id).await {
                debug!(target: "client.session", call_id = %call_id, error = %e, "Best-effort leave failed");
            }
        });
    }

    /// Send an event about the current call, if the local user is in one.
    fn emit_in_call(&self, event: impl FnOnce(CallId) -> ClientEvent) {
        if !self.state.in_call() {
            return;
        }
        if let Some(call) = &self.call {
            self.signaling.send(event(call.id));
        }
    }

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        debug!(target: "client.session", from = %self.state, to = %state, "State changed");
        self.state = state;
        self.notify(CallNotice::StateChanged { state });
    }

    fn notify(&self, notice: CallNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .entries()
            .map(|entry| PeerSummary {
                user_id: entry.user_id().clone(),
                initiator: entry.initiator(),
                connected: entry.is_connected(),
                has_remote_stream: entry.remote_stream().is_some(),
            })
            .collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        SessionSnapshot {
            user_id: self.user_id.clone(),
            state: self.state,
            call: self.call.clone(),
            roster: self.roster.clone(),
            pending_invitees: self.pending.clone(),
            media: self.media.state(),
            peers,
            transition_in_flight: self.in_flight.is_some(),
            deferred_events: self.deferred.len(),
            signaling_connected: self.signaling_connected,
        }
    }
}

async fn start_call_task(
    media: impl Future<Output = Result<LocalStream, CallError>>,
    api: Arc<dyn CallApi>,
    request: StartCallRequest,
) -> Result<StartedCall, CallError> {
    let stream = media.await?;
    match api.start_call(&request).await {
        Ok(call) => Ok(StartedCall {
            stream,
            call,
            invitees: request.participants,
        }),
        Err(e) => {
            stream.stop_all();
            Err(e)
        }
    }
}

async fn accept_call_task(
    media: impl Future<Output = Result<LocalStream, CallError>>,
    api: Arc<dyn CallApi>,
    call_id: CallId,
) -> Result<AcceptedCall, CallError> {
    let stream = media.await?;
    match api.join_call(call_id).await {
        Ok(joined) => Ok(AcceptedCall { stream, joined }),
        Err(e) => {
            stream.stop_all();
            Err(e)
        }
    }
}

/// Invitees in order, without duplicates or the local user.
fn dedup_invitees(invitees: Vec<UserId>, local: &UserId) -> Vec<UserId> {
    let mut pending: Vec<UserId> = Vec::with_capacity(invitees.len());
    for user_id in invitees {
        if &user_id != local && !pending.contains(&user_id) {
            pending.push(user_id);
        }
    }
    pending
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_invitees() {
        let local = UserId::from("u1");
        let pending = dedup_invitees(
            vec![
                UserId::from("u2"),
                UserId::from("u1"),
                UserId::from("u3"),
                UserId::from("u2"),
            ],
            &local,
        );
        assert_eq!(pending, vec![UserId::from("u2"), UserId::from("u3")]);
    }
}
