//! WebSocket signaling transport (tokio-tungstenite).
//!
//! A background task owns the socket. It connects, forwards outbound events,
//! decodes inbound frames and reconnects with exponential backoff when the
//! socket drops. After every reconnect it re-sends `register` for the
//! registered user before reporting `Reconnected`.
//!
//! Of the events queued while disconnected, only membership changes
//! (`call-started`, `joined-call`, `left-call`, `reject-call`) are delivered
//! after the reconnect, right behind `register`. Negotiation and media
//! toggles are stale by then and are dropped.

use super::{BackoffConfig, ChannelEvent, SignalingChannel};

use common::protocol::{ClientEvent, ServerEvent};
use common::types::UserId;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared between the handle and the transport task.
#[derive(Default)]
struct Shared {
    user_id: Mutex<Option<UserId>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl Shared {
    fn registered_user(&self) -> Option<UserId> {
        self.user_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify(&self, event: ChannelEvent) {
        let mut subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = subscriber.as_ref() {
            if tx.send(event).is_err() {
                debug!(target: "client.signaling", "Subscriber gone");
                *subscriber = None;
            }
        }
    }
}

/// `SignalingChannel` over a WebSocket to the relay.
pub struct WsSignalingChannel {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    shared: Arc<Shared>,
    cancel_token: CancellationToken,
}

impl WsSignalingChannel {
    /// Start the transport task for `url`.
    ///
    /// The task stops when `cancel_token` is cancelled or the channel is
    /// dropped.
    #[must_use]
    pub fn connect(
        url: impl Into<String>,
        backoff: BackoffConfig,
        cancel_token: &CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let cancel_token = cancel_token.child_token();

        let task = TransportTask {
            url: url.into(),
            backoff,
            outbound: outbound_rx,
            shared: Arc::clone(&shared),
            cancel_token: cancel_token.clone(),
        };
        let task_handle = tokio::spawn(task.run());

        (
            Self {
                outbound,
                shared,
                cancel_token,
            },
            task_handle,
        )
    }

    /// Stop the transport task.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }
}

impl SignalingChannel for WsSignalingChannel {
    fn register(&self, user_id: UserId) {
        {
            let mut current = self
                .shared
                .user_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if current.as_ref() == Some(&user_id) {
                return;
            }
            *current = Some(user_id.clone());
        }
        self.send(ClientEvent::Register { user_id });
    }

    fn send(&self, event: ClientEvent) {
        if self.outbound.send(event).is_err() {
            debug!(target: "client.signaling", "Transport stopped, event dropped");
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .shared
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Dropped,
    Stopped,
}

struct TransportTask {
    url: String,
    backoff: BackoffConfig,
    outbound: mpsc::UnboundedReceiver<ClientEvent>,
    shared: Arc<Shared>,
    cancel_token: CancellationToken,
}

impl TransportTask {
    #[instrument(skip_all, name = "client.signaling.transport", fields(url = %self.url))]
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut connected_before = false;

        loop {
            let result = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match result {
                Ok((stream, _)) => {
                    info!(
                        target: "client.signaling",
                        reconnect = connected_before,
                        "Signaling connected"
                    );
                    attempt = 0;

                    let end = self.session(stream, connected_before).await;
                    connected_before = true;
                    if end == SessionEnd::Stopped {
                        break;
                    }

                    warn!(target: "client.signaling", "Signaling connection lost");
                    self.shared.notify(ChannelEvent::Disconnected);
                }
                Err(e) => {
                    warn!(
                        target: "client.signaling",
                        error = %e,
                        attempt,
                        "Signaling connect failed"
                    );
                }
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                target: "client.signaling",
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Waiting before reconnect"
            );
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        debug!(target: "client.signaling", "Signaling transport stopped");
    }

    async fn session(&mut self, stream: WsStream, reconnect: bool) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        // Queued before the first connect: keep all. Queued while down:
        // keep membership changes only.
        let mut queued = Vec::new();
        let mut discarded = 0usize;
        while let Ok(event) = self.outbound.try_recv() {
            if matches!(event, ClientEvent::Register { .. }) {
                continue;
            }
            if reconnect && !event.changes_membership() {
                discarded += 1;
                continue;
            }
            queued.push(event);
        }
        if discarded > 0 {
            debug!(
                target: "client.signaling",
                discarded,
                kept = queued.len(),
                "Discarding stale events queued while disconnected"
            );
        }

        if let Some(user_id) = self.shared.registered_user() {
            queued.insert(0, ClientEvent::Register { user_id });
        }
        for event in queued {
            if send_event(&mut write, &event).await.is_err() {
                return SessionEnd::Dropped;
            }
        }

        if reconnect {
            self.shared.notify(ChannelEvent::Reconnected);
        }

        self.pump(&mut write, &mut read).await
    }

    async fn pump(
        &mut self,
        write: &mut SplitSink<WsStream, Message>,
        read: &mut SplitStream<WsStream>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Stopped;
                }

                event = self.outbound.recv() => {
                    let Some(event) = event else {
                        return SessionEnd::Stopped;
                    };
                    if send_event(write, &event).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }

                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ServerEvent::decode(&text) {
                        Ok(event) => {
                            debug!(
                                target: "client.signaling",
                                event = event.name(),
                                "Received event"
                            );
                            self.shared.notify(ChannelEvent::Message(event));
                        }
                        Err(e) => {
                            warn!(
                                target: "client.signaling",
                                error = %e,
                                "Dropping malformed frame"
                            );
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "client.signaling", error = %e, "Signaling read failed");
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }
}

/// Encode and write one event. Encoding failures are logged and skipped;
/// only socket failures are returned.
async fn send_event(
    write: &mut SplitSink<WsStream, Message>,
    event: &ClientEvent,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let frame = match event.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(
                target: "client.signaling",
                event = event.name(),
                error = %e,
                "Failed to encode event"
            );
            return Ok(());
        }
    };

    write.send(Message::Text(frame)).await.map_err(|e| {
        warn!(
            target: "client.signaling",
            event = event.name(),
            error = %e,
            "Signaling write failed"
        );
        e
    })
}
