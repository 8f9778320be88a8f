//! `RelayControllerActor` - singleton supervisor for call actors.
//!
//! - Owns the call table and the presence registry's write path
//! - Creates a `CallActor` per `call-started`, reaps it when it finishes
//! - Tracks disconnected users and, once their grace period expires, tells
//!   every call they may belong to
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! Routing of call events does not pass through this actor's loop: the
//! handle looks up the `CallActorHandle` and talks to the call directly, so
//! different calls proceed in parallel.

use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::presence::PresenceRegistry;

use super::call::{CallActor, CallActorHandle};
use super::connection::ConnectionActorHandle;
use super::messages::{ControllerMessage, NewCall, RelayStatus};
use super::metrics::{ActorType, MailboxMonitor, RelayMetrics};

use common::protocol::ClientEvent;
use common::types::{CallId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// How often disconnect grace periods are checked.
const GRACE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for each call actor.
const CALL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Static settings for the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub relay_id: String,
    pub max_calls: usize,
    pub max_participants_per_call: usize,
    pub disconnect_grace_period: Duration,
}

/// Handle to the `RelayControllerActor`.
#[derive(Clone, Debug)]
pub struct RelayControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<RelayMetrics>,
}

impl RelayControllerHandle {
    /// Spawn the controller actor and return a handle to it.
    #[must_use]
    pub fn new(
        settings: ControllerSettings,
        presence: PresenceRegistry,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RelayControllerActor::new(
            settings,
            presence,
            receiver,
            cancel_token.clone(),
            Arc::clone(&metrics),
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            metrics,
        }
    }

    /// Bind `connection` to `user_id`.
    pub async fn register(
        &self,
        user_id: UserId,
        connection: ConnectionActorHandle,
    ) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Register {
                user_id,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Report that a registered connection closed.
    pub async fn connection_closed(
        &self,
        user_id: UserId,
        connection_id: String,
    ) -> Result<(), RelayError> {
        self.sender
            .send(ControllerMessage::ConnectionClosed {
                user_id,
                connection_id,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn create_call(&self, request: NewCall) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::CreateCall {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_call(&self, call_id: CallId) -> Result<CallActorHandle, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetCall {
                call_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<RelayStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Route a client event from a registered user.
    ///
    /// `register` is handled by the socket layer, not here.
    pub async fn route(&self, user_id: UserId, event: ClientEvent) -> Result<(), RelayError> {
        let name = event.name();
        let started = Instant::now();

        let result = self.dispatch(user_id, event).await;

        prom::record_event_latency(name, started.elapsed());
        prom::record_event_routed(
            name,
            result.as_ref().map_or_else(RelayError::metric_label, |_| "ok"),
        );
        result
    }

    async fn dispatch(&self, user_id: UserId, event: ClientEvent) -> Result<(), RelayError> {
        match event {
            ClientEvent::Register { .. } => Err(RelayError::InvalidEvent(
                "register must be handled by the connection".to_string(),
            )),
            ClientEvent::CallStarted {
                call_id,
                channel_id,
                workspace_id,
                call_type,
                participants,
            } => {
                self.create_call(NewCall {
                    call_id,
                    initiator: user_id,
                    channel_id,
                    workspace_id,
                    call_type,
                    invitees: participants,
                })
                .await
            }
            other => {
                let call_id = other
                    .call_id()
                    .ok_or_else(|| RelayError::InvalidEvent(other.name().to_string()))?;
                let call = self.get_call(call_id).await?;
                call.client_event(user_id, other).await
            }
        }
    }

    /// Stop accepting calls and cancel all actors.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for connection actors and servers.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed call.
struct ManagedCall {
    handle: CallActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RelayControllerActor` implementation.
pub struct RelayControllerActor {
    settings: ControllerSettings,
    presence: PresenceRegistry,
    receiver: mpsc::Receiver<ControllerMessage>,
    cancel_token: CancellationToken,
    calls: HashMap<CallId, ManagedCall>,
    /// Users whose last connection dropped, and when.
    disconnected: HashMap<UserId, Instant>,
    accepting_new: bool,
    metrics: Arc<RelayMetrics>,
    mailbox: MailboxMonitor,
}

impl RelayControllerActor {
    fn new(
        settings: ControllerSettings,
        presence: PresenceRegistry,
        receiver: mpsc::Receiver<ControllerMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Controller, &settings.relay_id);

        Self {
            settings,
            presence,
            receiver,
            cancel_token,
            calls: HashMap::new(),
            disconnected: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "relay.actor.controller", fields(relay_id = %self.settings.relay_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.controller",
            relay_id = %self.settings.relay_id,
            max_calls = self.settings.max_calls,
            grace_period_secs = self.settings.disconnect_grace_period.as_secs(),
            "RelayControllerActor started"
        );

        let mut grace_check = tokio::time::interval(GRACE_CHECK_INTERVAL);
        grace_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.check_call_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.controller",
                        relay_id = %self.settings.relay_id,
                        "RelayControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = grace_check.tick() => {
                    self.check_disconnect_timeouts().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "relay.actor.controller",
                                relay_id = %self.settings.relay_id,
                                "RelayControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.controller",
            relay_id = %self.settings.relay_id,
            calls_remaining = self.calls.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RelayControllerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Register {
                user_id,
                connection,
                respond_to,
            } => {
                let result = self.register(user_id, connection).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::ConnectionClosed {
                user_id,
                connection_id,
            } => {
                self.connection_closed(user_id, &connection_id).await;
            }

            ControllerMessage::CreateCall {
                request,
                respond_to,
            } => {
                let result = self.create_call(request);
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetCall {
                call_id,
                respond_to,
            } => {
                let result = self
                    .calls
                    .get(&call_id)
                    .map(|managed| managed.handle.clone())
                    .ok_or_else(|| RelayError::CallNotFound(call_id.to_string()));
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let status = self.get_status().await;
                let _ = respond_to.send(status);
            }

            ControllerMessage::Shutdown { respond_to } => {
                info!(
                    target: "relay.actor.controller",
                    relay_id = %self.settings.relay_id,
                    call_count = self.calls.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn register(
        &mut self,
        user_id: UserId,
        connection: ConnectionActorHandle,
    ) -> Result<(), RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        let resumed = self.disconnected.remove(&user_id).is_some();
        let connection_id = connection.connection_id().to_string();

        if let Some(previous) = self.presence.bind(user_id.clone(), connection).await {
            info!(
                target: "relay.actor.controller",
                user_id = %user_id,
                old_connection_id = %previous.connection_id(),
                new_connection_id = %connection_id,
                "Newer connection replaces existing one"
            );
            let _ = previous.close("replaced by newer connection".to_string()).await;
        }

        info!(
            target: "relay.actor.controller",
            user_id = %user_id,
            connection_id = %connection_id,
            resumed,
            "User registered"
        );

        Ok(())
    }

    async fn connection_closed(&mut self, user_id: UserId, connection_id: &str) {
        if !self.presence.unbind(&user_id, connection_id).await {
            debug!(
                target: "relay.actor.controller",
                user_id = %user_id,
                connection_id = %connection_id,
                "Stale connection closed, user already on a newer one"
            );
            return;
        }

        info!(
            target: "relay.actor.controller",
            user_id = %user_id,
            connection_id = %connection_id,
            grace_period_secs = self.settings.disconnect_grace_period.as_secs(),
            "User disconnected, grace period started"
        );
        self.disconnected.insert(user_id, Instant::now());
    }

    fn create_call(&mut self, request: NewCall) -> Result<(), RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        // Don't include the call id in the client-facing conflict message
        if self.calls.contains_key(&request.call_id) {
            return Err(RelayError::Conflict("Call already exists".to_string()));
        }

        if self.calls.len() >= self.settings.max_calls {
            return Err(RelayError::CapacityExceeded(format!(
                "relay hosts {} calls",
                self.calls.len()
            )));
        }

        let call_id = request.call_id;
        let call_type = request.call_type;
        let (handle, task_handle) = CallActor::spawn(
            request,
            self.settings.max_participants_per_call,
            self.presence.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.calls.insert(
            call_id,
            ManagedCall {
                handle,
                task_handle,
            },
        );
        self.metrics.call_created();

        info!(
            target: "relay.actor.controller",
            call_id = %call_id,
            call_type = call_type.as_str(),
            total_calls = self.calls.len(),
            "Call actor created"
        );

        Ok(())
    }

    async fn get_status(&self) -> RelayStatus {
        RelayStatus {
            call_count: self.calls.len(),
            online_users: self.presence.len().await,
            disconnected_users: self.disconnected.len(),
            connection_count: self.metrics.connection_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Expire disconnect grace periods.
    async fn check_disconnect_timeouts(&mut self) {
        let grace = self.settings.disconnect_grace_period;
        let now = Instant::now();

        let expired: Vec<UserId> = self
            .disconnected
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= grace)
            .map(|(user, _)| user.clone())
            .collect();

        for user_id in expired {
            self.disconnected.remove(&user_id);

            info!(
                target: "relay.actor.controller",
                user_id = %user_id,
                "Disconnect grace period expired, leaving calls"
            );

            for managed in self.calls.values() {
                if let Err(e) = managed.handle.member_gone(user_id.clone()).await {
                    debug!(
                        target: "relay.actor.controller",
                        call_id = %managed.handle.call_id(),
                        error = %e,
                        "Call actor gone before member removal"
                    );
                }
            }
        }
    }

    /// Reap finished call actors.
    async fn check_call_health(&mut self) {
        let finished: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for call_id in finished {
            let Some(managed) = self.calls.remove(&call_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "relay.actor.controller",
                        call_id = %call_id,
                        "Call actor exited"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "relay.actor.controller",
                        call_id = %call_id,
                        error = ?join_error,
                        "Call actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Call);
                }
                Err(_) => {}
            }

            self.metrics.call_removed();
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "relay.actor.controller",
            relay_id = %self.settings.relay_id,
            call_count = self.calls.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.calls.values() {
            managed.handle.cancel();
        }

        for (call_id, managed) in self.calls.drain() {
            match tokio::time::timeout(CALL_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "relay.actor.controller",
                        call_id = %call_id,
                        error = ?e,
                        "Call actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.controller",
                        call_id = %call_id,
                        "Call actor shutdown timed out"
                    );
                }
            }
            self.metrics.call_removed();
        }

        for connection in self.presence.drain().await {
            connection.cancel();
        }

        info!(
            target: "relay.actor.controller",
            relay_id = %self.settings.relay_id,
            "Graceful shutdown complete"
        );
    }
}
