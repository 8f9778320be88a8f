//! `ConnectionActor` - one per WebSocket connection.
//!
//! Receives `ServerEvent`s from call actors and the controller, encodes them
//! and hands text frames to the socket writer task. The actor never blocks on
//! the socket: when the writer falls behind, frames are dropped and counted.
//!
//! # Lifecycle
//!
//! 1. Spawned by the WebSocket handler on upgrade
//! 2. Runs until the socket closes, it is replaced by a newer connection for
//!    the same user, or the relay shuts down
//! 3. Dropping the frame sender on exit ends the writer task

use crate::errors::RelayError;

use super::messages::ConnectionMessage;
use super::metrics::{ActorType, MailboxMonitor, RelayMetrics};

use common::protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an event for delivery to the client.
    pub async fn send(&self, event: ServerEvent) -> Result<(), RelayError> {
        self.sender
            .send(ConnectionMessage::Send { event })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    /// Ask the actor to close the connection.
    pub async fn close(&self, reason: String) -> Result<(), RelayError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    /// Encoded frames for the socket writer.
    frames: mpsc::Sender<String>,
    metrics: Arc<RelayMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor writing into `frames`.
    pub fn spawn(
        connection_id: String,
        frames: mpsc::Sender<String>,
        cancel_token: CancellationToken,
        metrics: Arc<RelayMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            frames,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "relay.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.mailbox.record_enqueue();
                    let should_exit = self.handle_message(message);
                    self.mailbox.record_dequeue();
                    self.metrics.record_message_processed();

                    if should_exit {
                        break;
                    }
                }
            }
        }

        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle one message. Returns `true` when the actor should exit.
    fn handle_message(&self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { event } => {
                let frame = match event.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(
                            target: "relay.actor.connection",
                            connection_id = %self.connection_id,
                            event = event.name(),
                            error = %e,
                            "Failed to encode server event"
                        );
                        return false;
                    }
                };

                match self.frames.try_send(frame) {
                    Ok(()) => false,
                    Err(TrySendError::Full(_)) => {
                        self.mailbox.record_drop();
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(
                            target: "relay.actor.connection",
                            connection_id = %self.connection_id,
                            "Socket writer gone, stopping"
                        );
                        true
                    }
                }
            }

            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Closing connection"
                );
                self.cancel_token.cancel();
                true
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::CallId;

    #[tokio::test]
    async fn test_send_writes_encoded_frame() {
        let (frames_tx, mut frames_rx) = mpsc::channel(8);
        let (handle, _task) = ConnectionActor::spawn(
            "conn-1".to_string(),
            frames_tx,
            CancellationToken::new(),
            RelayMetrics::new(),
        );

        let call_id = CallId::new();
        handle.send(ServerEvent::CallEnded { call_id }).await.unwrap();

        let frame = frames_rx.recv().await.unwrap();
        assert_eq!(
            ServerEvent::decode(&frame).unwrap(),
            ServerEvent::CallEnded { call_id }
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_full_writer_drops_instead_of_blocking() {
        let (frames_tx, mut frames_rx) = mpsc::channel(1);
        let (handle, _task) = ConnectionActor::spawn(
            "conn-2".to_string(),
            frames_tx,
            CancellationToken::new(),
            RelayMetrics::new(),
        );

        for _ in 0..3 {
            handle
                .send(ServerEvent::CallEnded {
                    call_id: CallId::new(),
                })
                .await
                .unwrap();
        }

        // The actor keeps running and the first frame is intact
        assert!(frames_rx.recv().await.is_some());
        handle.close("test".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_actor_and_writer() {
        let (frames_tx, mut frames_rx) = mpsc::channel(8);
        let (handle, task) = ConnectionActor::spawn(
            "conn-3".to_string(),
            frames_tx,
            CancellationToken::new(),
            RelayMetrics::new(),
        );

        handle.close("replaced".to_string()).await.unwrap();
        task.await.unwrap();

        assert!(handle.is_cancelled());
        assert!(frames_rx.recv().await.is_none(), "frame sender dropped");
    }
}
