//! `CallActor` - one per live call.
//!
//! Authoritative for "who is in this call". Every event for the call passes
//! through this actor's mailbox, so roster changes and the broadcasts they
//! trigger are observed in the same order by all members.
//!
//! # Roster rules
//!
//! - `joined-call` adds the sender, tells the other members and the
//!   initiator; from an existing member (a rejoin after reconnect) it only
//!   answers with `call-roster`
//! - `reject-call` removes a pending invitee
//! - `left-call` removes a member
//! - the call ends when the roster is empty, or for `voice`/`video` when fewer
//!   than two members remain and nobody is still pending; a `huddle` survives
//!   with a single member

use crate::errors::RelayError;
use crate::presence::PresenceRegistry;

use super::messages::{CallMessage, CallSnapshot, NewCall};
use super::metrics::{ActorType, MailboxMonitor, RelayMetrics};

use chrono::Utc;
use common::protocol::{ClientEvent, ServerEvent};
use common::types::{Call, CallId, CallParticipant, UserId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the call mailbox.
const CALL_CHANNEL_BUFFER: usize = 500;

/// Handle to a `CallActor`.
#[derive(Clone, Debug)]
pub struct CallActorHandle {
    sender: mpsc::Sender<CallMessage>,
    cancel_token: CancellationToken,
    call_id: CallId,
}

impl CallActorHandle {
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Apply a client event from `user_id` to this call.
    pub async fn client_event(&self, user_id: UserId, event: ClientEvent) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::ClientEvent {
                user_id,
                event,
                respond_to: tx,
            })
            .await
            .map_err(|_| RelayError::CallNotFound(self.call_id.to_string()))?;

        // A call that ended while the event was queued drops the reply
        rx.await
            .map_err(|_| RelayError::CallNotFound(self.call_id.to_string()))?
    }

    /// Treat `user_id` as gone (disconnect grace period expired).
    pub async fn member_gone(&self, user_id: UserId) -> Result<(), RelayError> {
        self.sender
            .send(CallMessage::MemberGone { user_id })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn get_state(&self) -> Result<CallSnapshot, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CallMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| RelayError::CallNotFound(self.call_id.to_string()))?;

        rx.await
            .map_err(|_| RelayError::CallNotFound(self.call_id.to_string()))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `CallActor` implementation.
pub struct CallActor {
    call: Call,
    /// Roster in join order.
    members: Vec<CallParticipant>,
    /// Invitees that have neither joined nor rejected.
    pending: Vec<UserId>,
    max_participants: usize,
    presence: PresenceRegistry,
    receiver: mpsc::Receiver<CallMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<RelayMetrics>,
    mailbox: MailboxMonitor,
    ended: bool,
}

impl CallActor {
    /// Spawn a call actor with the initiator as first member.
    ///
    /// Invitees are sent `incoming-call` before the actor processes any
    /// message.
    pub fn spawn(
        request: NewCall,
        max_participants: usize,
        presence: PresenceRegistry,
        cancel_token: CancellationToken,
        metrics: Arc<RelayMetrics>,
    ) -> (CallActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);
        let call_id = request.call_id;

        let call = Call {
            id: request.call_id,
            channel_id: request.channel_id,
            workspace_id: request.workspace_id,
            call_type: request.call_type,
            initiator: request.initiator.clone(),
            created_at: Utc::now(),
        };

        let mut pending: Vec<UserId> = Vec::with_capacity(request.invitees.len());
        for invitee in request.invitees {
            if invitee != request.initiator && !pending.contains(&invitee) {
                pending.push(invitee);
            }
        }

        let actor = Self {
            call,
            members: vec![CallParticipant::joined_now(request.initiator)],
            pending,
            max_participants,
            presence,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Call, call_id.to_string()),
            ended: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = CallActorHandle {
            sender,
            cancel_token,
            call_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "relay.actor.call",
        fields(call_id = %self.call.id, call_type = self.call.call_type.as_str())
    )]
    async fn run(mut self) {
        info!(
            target: "relay.actor.call",
            call_id = %self.call.id,
            initiator = %self.call.initiator,
            invitees = self.pending.len(),
            "CallActor started"
        );

        self.invite_pending().await;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.call",
                        call_id = %self.call.id,
                        "CallActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.mailbox.record_enqueue();
                    self.handle_message(message).await;
                    self.mailbox.record_dequeue();
                    self.metrics.record_message_processed();

                    if self.ended {
                        break;
                    }
                }
            }
        }

        info!(
            target: "relay.actor.call",
            call_id = %self.call.id,
            ended = self.ended,
            members = self.members.len(),
            messages_processed = self.mailbox.messages_processed(),
            "CallActor stopped"
        );
    }

    async fn handle_message(&mut self, message: CallMessage) {
        match message {
            CallMessage::ClientEvent {
                user_id,
                event,
                respond_to,
            } => {
                let result = self.handle_client_event(user_id, event).await;
                let _ = respond_to.send(result);
            }

            CallMessage::MemberGone { user_id } => {
                if self.is_member(&user_id) {
                    info!(
                        target: "relay.actor.call",
                        call_id = %self.call.id,
                        user_id = %user_id,
                        "Disconnect grace period expired, removing member"
                    );
                    self.remove_member(&user_id).await;
                } else if self.is_pending(&user_id) {
                    self.remove_pending(&user_id).await;
                }
            }

            CallMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    async fn handle_client_event(
        &mut self,
        user_id: UserId,
        event: ClientEvent,
    ) -> Result<(), RelayError> {
        match event {
            ClientEvent::JoinedCall { .. } => self.handle_joined(user_id).await,

            ClientEvent::RejectCall { .. } => {
                if !self.is_pending(&user_id) {
                    return Err(self.not_a_member());
                }
                self.remove_pending(&user_id).await;
                Ok(())
            }

            ClientEvent::LeftCall { .. } => {
                if self.is_member(&user_id) {
                    self.remove_member(&user_id).await;
                    Ok(())
                } else if self.is_pending(&user_id) {
                    // Leaving before joining is a decline
                    self.remove_pending(&user_id).await;
                    Ok(())
                } else {
                    Err(self.not_a_member())
                }
            }

            ClientEvent::Signal { to, signal, .. } => self.handle_signal(user_id, to, signal).await,

            ClientEvent::ToggleAudio { enabled, .. } => {
                self.update_member(&user_id, |m| m.audio_enabled = enabled)?;
                self.broadcast_except(
                    &user_id,
                    ServerEvent::ToggleAudio {
                        call_id: self.call.id,
                        user_id: user_id.clone(),
                        enabled,
                    },
                )
                .await;
                Ok(())
            }

            ClientEvent::ToggleVideo { enabled, .. } => {
                self.update_member(&user_id, |m| m.video_enabled = enabled)?;
                self.broadcast_except(
                    &user_id,
                    ServerEvent::ToggleVideo {
                        call_id: self.call.id,
                        user_id: user_id.clone(),
                        enabled,
                    },
                )
                .await;
                Ok(())
            }

            ClientEvent::ScreenShareStarted { .. } => {
                self.update_member(&user_id, |m| m.screen_sharing = true)?;
                self.broadcast_except(
                    &user_id,
                    ServerEvent::ScreenShareStarted {
                        call_id: self.call.id,
                        user_id: user_id.clone(),
                    },
                )
                .await;
                Ok(())
            }

            ClientEvent::ScreenShareEnded { .. } => {
                self.update_member(&user_id, |m| m.screen_sharing = false)?;
                self.broadcast_except(
                    &user_id,
                    ServerEvent::ScreenShareEnded {
                        call_id: self.call.id,
                        user_id: user_id.clone(),
                    },
                )
                .await;
                Ok(())
            }

            ClientEvent::Register { .. } | ClientEvent::CallStarted { .. } => Err(
                RelayError::InvalidEvent(format!("{} is not a call event", event.name())),
            ),
        }
    }

    async fn handle_joined(&mut self, user_id: UserId) -> Result<(), RelayError> {
        if self.is_member(&user_id) {
            debug!(
                target: "relay.actor.call",
                call_id = %self.call.id,
                user_id = %user_id,
                "Member rejoined, sending roster"
            );
            self.presence
                .send_to(
                    &user_id,
                    ServerEvent::CallRoster {
                        call_id: self.call.id,
                        participants: self.members.clone(),
                    },
                )
                .await;
            return Ok(());
        }

        if self.members.len() >= self.max_participants {
            return Err(RelayError::CapacityExceeded(format!(
                "call {} has {} members",
                self.call.id,
                self.members.len()
            )));
        }

        self.pending.retain(|p| p != &user_id);
        let participant = CallParticipant::joined_now(user_id.clone());
        self.members.push(participant.clone());

        info!(
            target: "relay.actor.call",
            call_id = %self.call.id,
            user_id = %user_id,
            members = self.members.len(),
            "Member joined"
        );

        self.broadcast_except(
            &user_id,
            ServerEvent::ParticipantJoined {
                call_id: self.call.id,
                participant,
            },
        )
        .await;

        if user_id != self.call.initiator {
            self.presence
                .send_to(
                    &self.call.initiator,
                    ServerEvent::CallAccepted {
                        call_id: self.call.id,
                        user_id,
                    },
                )
                .await;
        }

        Ok(())
    }

    async fn handle_signal(
        &self,
        from: UserId,
        to: UserId,
        signal: Value,
    ) -> Result<(), RelayError> {
        if !self.is_member(&from) || !self.is_member(&to) {
            return Err(self.not_a_member());
        }

        self.presence
            .send_to(
                &to,
                ServerEvent::Signal {
                    from,
                    signal,
                    call_id: self.call.id,
                },
            )
            .await;
        Ok(())
    }

    /// Remove a member, notify the rest, and end the call if the rules say so.
    async fn remove_member(&mut self, user_id: &UserId) {
        self.members.retain(|m| &m.user_id != user_id);

        info!(
            target: "relay.actor.call",
            call_id = %self.call.id,
            user_id = %user_id,
            members = self.members.len(),
            "Member left"
        );

        self.broadcast_except(
            user_id,
            ServerEvent::ParticipantLeft {
                call_id: self.call.id,
                user_id: user_id.clone(),
            },
        )
        .await;

        self.end_if_over().await;
    }

    /// Remove a pending invitee, notify members, and end the call if the rules say so.
    async fn remove_pending(&mut self, user_id: &UserId) {
        self.pending.retain(|p| p != user_id);

        debug!(
            target: "relay.actor.call",
            call_id = %self.call.id,
            user_id = %user_id,
            pending = self.pending.len(),
            "Invitee declined"
        );

        self.broadcast_except(
            user_id,
            ServerEvent::CallRejected {
                call_id: self.call.id,
                user_id: user_id.clone(),
            },
        )
        .await;

        self.end_if_over().await;
    }

    fn should_end(&self) -> bool {
        if self.members.is_empty() {
            return true;
        }
        !self.call.call_type.persists_alone() && self.members.len() < 2 && self.pending.is_empty()
    }

    async fn end_if_over(&mut self) {
        if !self.should_end() {
            return;
        }

        info!(
            target: "relay.actor.call",
            call_id = %self.call.id,
            remaining = self.members.len(),
            "Call ended"
        );

        let event = ServerEvent::CallEnded {
            call_id: self.call.id,
        };
        let recipients: Vec<UserId> = self
            .members
            .iter()
            .map(|m| m.user_id.clone())
            .chain(self.pending.iter().cloned())
            .collect();
        for user_id in &recipients {
            self.presence.send_to(user_id, event.clone()).await;
        }

        self.ended = true;
    }

    /// Send `incoming-call` to every pending invitee.
    async fn invite_pending(&self) {
        let participants: Vec<UserId> = self.members.iter().map(|m| m.user_id.clone()).collect();
        for invitee in &self.pending {
            let delivered = self
                .presence
                .send_to(
                    invitee,
                    ServerEvent::IncomingCall {
                        call: self.call.clone(),
                        participants: participants.clone(),
                    },
                )
                .await;
            if !delivered {
                debug!(
                    target: "relay.actor.call",
                    call_id = %self.call.id,
                    user_id = %invitee,
                    "Invitee offline, incoming-call not delivered"
                );
            }
        }
    }

    /// Send `event` to every member except `except`.
    async fn broadcast_except(&self, except: &UserId, event: ServerEvent) {
        for member in &self.members {
            if &member.user_id != except
                && !self.presence.send_to(&member.user_id, event.clone()).await
            {
                warn!(
                    target: "relay.actor.call",
                    call_id = %self.call.id,
                    user_id = %member.user_id,
                    event = event.name(),
                    "Broadcast not delivered"
                );
            }
        }
    }

    fn update_member<F>(&mut self, user_id: &UserId, update: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut CallParticipant),
    {
        match self.members.iter_mut().find(|m| &m.user_id == user_id) {
            Some(member) => {
                update(member);
                Ok(())
            }
            None => Err(self.not_a_member()),
        }
    }

    fn is_member(&self, user_id: &UserId) -> bool {
        self.members.iter().any(|m| &m.user_id == user_id)
    }

    fn is_pending(&self, user_id: &UserId) -> bool {
        self.pending.contains(user_id)
    }

    fn not_a_member(&self) -> RelayError {
        RelayError::NotAMember(self.call.id.to_string())
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call: self.call.clone(),
            members: self.members.clone(),
            pending: self.pending.clone(),
        }
    }
}
