//! WebSocket endpoint.
//!
//! Each upgraded socket gets a `ConnectionActor` for outbound events and a
//! writer task that pumps encoded frames into the socket. The handler itself
//! is the reader: it decodes client events, binds the connection on
//! `register`, and routes everything else through the controller handle.
//! Rejected events are answered with an `error` event on the same socket.

use crate::actors::{ConnectionActor, ConnectionActorHandle, RelayControllerHandle};
use crate::errors::RelayError;
use crate::observability::metrics as prom;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::protocol::{ClientEvent, ServerEvent};
use common::types::UserId;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Outbound frames buffered per socket before events are dropped.
const FRAME_BUFFER: usize = 256;

/// Router serving `GET /ws`.
pub fn ws_router(controller: RelayControllerHandle) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(controller)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(controller): State<RelayControllerHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, controller))
}

#[instrument(skip_all, name = "relay.ws", fields(connection_id = tracing::field::Empty))]
async fn handle_socket(socket: WebSocket, controller: RelayControllerHandle) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let metrics = Arc::clone(controller.metrics());
    metrics.connection_opened();

    let (mut sink, mut stream) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let cancel_token = controller.child_token();

    let (connection, connection_task) = ConnectionActor::spawn(
        connection_id.clone(),
        frames_tx,
        cancel_token.clone(),
        Arc::clone(&metrics),
    );

    // Writer: ends when the connection actor drops its frame sender
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    debug!(target: "relay.ws", connection_id = %connection_id, "WebSocket connected");

    let mut registered: Option<UserId> = None;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(
                    target: "relay.ws",
                    connection_id = %connection_id,
                    "Connection cancelled"
                );
                break;
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&controller, &connection, &mut registered, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            target: "relay.ws",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    if let Some(user_id) = registered {
        info!(
            target: "relay.ws",
            connection_id = %connection_id,
            user_id = %user_id,
            "WebSocket closed"
        );
        if let Err(e) = controller
            .connection_closed(user_id, connection_id.clone())
            .await
        {
            debug!(target: "relay.ws", error = %e, "Controller unavailable on close");
        }
    }

    connection.cancel();
    let _ = connection_task.await;
    metrics.connection_closed();
}

/// Decode and act on one text frame.
async fn handle_frame(
    controller: &RelayControllerHandle,
    connection: &ConnectionActorHandle,
    registered: &mut Option<UserId>,
    text: &str,
) {
    let event = match ClientEvent::decode(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(
                target: "relay.ws",
                connection_id = %connection.connection_id(),
                error = %e,
                "Rejecting undecodable frame"
            );
            prom::record_event_routed("unknown", "invalid_event");
            reply_error(connection, &RelayError::InvalidEvent(e.to_string())).await;
            return;
        }
    };

    let rejoin = match &event {
        ClientEvent::JoinedCall { call_id } => Some(*call_id),
        _ => None,
    };

    let result = match event {
        ClientEvent::Register { user_id } => register(controller, connection, registered, user_id).await,
        other => match registered.clone() {
            Some(user_id) => controller.route(user_id, other).await,
            None => {
                prom::record_event_routed(other.name(), RelayError::NotRegistered.metric_label());
                Err(RelayError::NotRegistered)
            }
        },
    };

    // A member rejoining a call that ended while it was away
    if let (Some(call_id), Err(RelayError::CallNotFound(_))) = (rejoin, &result) {
        debug!(
            target: "relay.ws",
            connection_id = %connection.connection_id(),
            call_id = %call_id,
            "Join for a finished call, replying call-ended"
        );
        if let Err(e) = connection.send(ServerEvent::CallEnded { call_id }).await {
            warn!(
                target: "relay.ws",
                connection_id = %connection.connection_id(),
                error = %e,
                "Failed to deliver call-ended"
            );
        }
        return;
    }

    if let Err(e) = result {
        debug!(
            target: "relay.ws",
            connection_id = %connection.connection_id(),
            error = %e,
            "Client event rejected"
        );
        reply_error(connection, &e).await;
    }
}

async fn register(
    controller: &RelayControllerHandle,
    connection: &ConnectionActorHandle,
    registered: &mut Option<UserId>,
    user_id: UserId,
) -> Result<(), RelayError> {
    let result = match registered.clone() {
        // Re-registering the same user on the same socket is a no-op
        Some(current) if current == user_id => Ok(()),
        Some(_) => Err(RelayError::Conflict(
            "Connection is registered to another user".to_string(),
        )),
        None => {
            controller
                .register(user_id.clone(), connection.clone())
                .await?;
            *registered = Some(user_id);
            Ok(())
        }
    };

    prom::record_event_routed(
        "register",
        result.as_ref().map_or_else(RelayError::metric_label, |_| "ok"),
    );
    result
}

async fn reply_error(connection: &ConnectionActorHandle, error: &RelayError) {
    let event = ServerEvent::Error {
        code: error.error_code(),
        message: error.client_message(),
    };
    if let Err(e) = connection.send(event).await {
        warn!(
            target: "relay.ws",
            connection_id = %connection.connection_id(),
            error = %e,
            "Failed to deliver error event"
        );
    }
}
