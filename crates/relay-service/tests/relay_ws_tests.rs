//! End-to-end tests for the relay WebSocket endpoint.
//!
//! Each test binds a relay on an ephemeral port and drives it with real
//! WebSocket clients speaking the JSON event protocol.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::time::Duration;

use common::protocol::{ClientEvent, ServerEvent};
use common::types::{CallId, CallType, UserId};
use futures_util::{SinkExt, StreamExt};
use relay_service::actors::{ControllerSettings, RelayControllerHandle, RelayMetrics};
use relay_service::presence::PresenceRegistry;
use relay_service::ws::ws_router;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Harness
// ============================================================================

async fn start_relay() -> (SocketAddr, RelayControllerHandle) {
    let controller = RelayControllerHandle::new(
        ControllerSettings {
            relay_id: "relay-test".to_string(),
            max_calls: 10,
            max_participants_per_call: 4,
            disconnect_grace_period: Duration::from_secs(30),
        },
        PresenceRegistry::new(),
        RelayMetrics::new(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = ws_router(controller.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, controller)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("relay accepts WebSocket upgrade");
    ws
}

async fn send(ws: &mut Client, event: &ClientEvent) {
    ws.send(Message::Text(event.encode().unwrap())).await.unwrap();
}

async fn recv(ws: &mut Client) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return ServerEvent::decode(&text).unwrap();
        }
    }
}

/// Receive until an event matches `pred`, skipping the rest.
async fn recv_until(ws: &mut Client, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = recv(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Frames on one socket are handled in order, so the error reply to a
/// trailing junk frame proves the preceding frames were processed.
async fn barrier(ws: &mut Client) {
    ws.send(Message::Text("{\"event\":\"barrier\"}".to_string()))
        .await
        .unwrap();
    let event = recv_until(ws, |e| matches!(e, ServerEvent::Error { .. })).await;
    assert!(matches!(event, ServerEvent::Error { code: 1, .. }));
}

async fn register(ws: &mut Client, user: &str) {
    send(
        ws,
        &ClientEvent::Register {
            user_id: UserId::from(user),
        },
    )
    .await;
    barrier(ws).await;
}

async fn start_call(ws: &mut Client, call_id: CallId, call_type: CallType, invitees: &[&str]) {
    send(
        ws,
        &ClientEvent::CallStarted {
            call_id,
            channel_id: "general".into(),
            workspace_id: "acme".into(),
            call_type,
            participants: invitees.iter().map(|u| UserId::from(*u)).collect(),
        },
    )
    .await;
}

/// Alice calls bob and bob joins. Returns once alice has seen the join.
async fn two_party_call(alice: &mut Client, bob: &mut Client, call_type: CallType) -> CallId {
    let call_id = CallId::new();
    start_call(alice, call_id, call_type, &["bob"]).await;
    recv_until(bob, |e| matches!(e, ServerEvent::IncomingCall { .. })).await;
    send(bob, &ClientEvent::JoinedCall { call_id }).await;
    recv_until(alice, |e| matches!(e, ServerEvent::CallAccepted { .. })).await;
    call_id
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_unregistered_event_is_rejected() {
    let (addr, controller) = start_relay().await;
    let mut ws = connect(addr).await;

    send(&mut ws, &ClientEvent::JoinedCall { call_id: CallId::new() }).await;

    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, 2),
        other => panic!("expected error, got {other:?}"),
    }

    controller.cancel();
}

#[tokio::test]
async fn test_malformed_frame_is_rejected() {
    let (addr, controller) = start_relay().await;
    let mut ws = connect(addr).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();

    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, 1),
        other => panic!("expected error, got {other:?}"),
    }

    controller.cancel();
}

#[tokio::test]
async fn test_call_flow_invite_join_signal_leave() {
    let (addr, controller) = start_relay().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    let call_id = CallId::new();
    start_call(&mut alice, call_id, CallType::Video, &["bob"]).await;

    // Bob is invited with the current roster
    match recv(&mut bob).await {
        ServerEvent::IncomingCall { call, participants } => {
            assert_eq!(call.id, call_id);
            assert_eq!(call.initiator, UserId::from("alice"));
            assert_eq!(call.call_type, CallType::Video);
            assert_eq!(participants, vec![UserId::from("alice")]);
        }
        other => panic!("expected incoming-call, got {other:?}"),
    }

    send(&mut bob, &ClientEvent::JoinedCall { call_id }).await;

    let joined = recv_until(&mut alice, |e| {
        matches!(e, ServerEvent::ParticipantJoined { .. })
    })
    .await;
    match joined {
        ServerEvent::ParticipantJoined {
            call_id: id,
            participant,
        } => {
            assert_eq!(id, call_id);
            assert_eq!(participant.user_id, UserId::from("bob"));
        }
        other => panic!("unexpected {other:?}"),
    }
    let accepted = recv_until(&mut alice, |e| matches!(e, ServerEvent::CallAccepted { .. })).await;
    assert_eq!(
        accepted,
        ServerEvent::CallAccepted {
            call_id,
            user_id: UserId::from("bob"),
        }
    );

    // Signals are delivered to the addressee only, stamped with the sender
    let offer = json!({"type": "offer", "sdp": "v=0"});
    send(
        &mut alice,
        &ClientEvent::Signal {
            to: UserId::from("bob"),
            signal: offer.clone(),
            call_id,
        },
    )
    .await;
    let signal = recv_until(&mut bob, |e| matches!(e, ServerEvent::Signal { .. })).await;
    assert_eq!(
        signal,
        ServerEvent::Signal {
            from: UserId::from("alice"),
            signal: offer,
            call_id,
        }
    );

    // Two-party video call ends when one side leaves
    send(&mut bob, &ClientEvent::LeftCall { call_id }).await;
    let left = recv_until(&mut alice, |e| matches!(e, ServerEvent::ParticipantLeft { .. })).await;
    assert_eq!(
        left,
        ServerEvent::ParticipantLeft {
            call_id,
            user_id: UserId::from("bob"),
        }
    );
    let ended = recv_until(&mut alice, |e| matches!(e, ServerEvent::CallEnded { .. })).await;
    assert_eq!(ended, ServerEvent::CallEnded { call_id });

    controller.cancel();
}

#[tokio::test]
async fn test_reject_notifies_initiator_and_ends_call() {
    let (addr, controller) = start_relay().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    let call_id = CallId::new();
    start_call(&mut alice, call_id, CallType::Voice, &["bob"]).await;
    recv_until(&mut bob, |e| matches!(e, ServerEvent::IncomingCall { .. })).await;

    send(&mut bob, &ClientEvent::RejectCall { call_id }).await;

    let rejected = recv_until(&mut alice, |e| matches!(e, ServerEvent::CallRejected { .. })).await;
    assert_eq!(
        rejected,
        ServerEvent::CallRejected {
            call_id,
            user_id: UserId::from("bob"),
        }
    );
    let ended = recv_until(&mut alice, |e| matches!(e, ServerEvent::CallEnded { .. })).await;
    assert_eq!(ended, ServerEvent::CallEnded { call_id });

    controller.cancel();
}

#[tokio::test]
async fn test_events_for_unknown_call_are_rejected() {
    let (addr, controller) = start_relay().await;
    let mut alice = connect(addr).await;
    register(&mut alice, "alice").await;

    send(
        &mut alice,
        &ClientEvent::ToggleAudio {
            call_id: CallId::new(),
            enabled: false,
        },
    )
    .await;

    match recv(&mut alice).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, 4),
        other => panic!("expected error, got {other:?}"),
    }

    controller.cancel();
}

#[tokio::test]
async fn test_toggle_is_broadcast_to_other_members() {
    let (addr, controller) = start_relay().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    let call_id = CallId::new();
    start_call(&mut alice, call_id, CallType::Huddle, &["bob"]).await;
    recv_until(&mut bob, |e| matches!(e, ServerEvent::IncomingCall { .. })).await;
    send(&mut bob, &ClientEvent::JoinedCall { call_id }).await;
    recv_until(&mut alice, |e| matches!(e, ServerEvent::ParticipantJoined { .. })).await;

    send(
        &mut alice,
        &ClientEvent::ToggleAudio {
            call_id,
            enabled: false,
        },
    )
    .await;

    let toggled = recv_until(&mut bob, |e| matches!(e, ServerEvent::ToggleAudio { .. })).await;
    assert_eq!(
        toggled,
        ServerEvent::ToggleAudio {
            call_id,
            user_id: UserId::from("alice"),
            enabled: false,
        }
    );

    controller.cancel();
}

#[tokio::test]
async fn test_second_registration_on_socket_for_other_user_conflicts() {
    let (addr, controller) = start_relay().await;
    let mut ws = connect(addr).await;
    register(&mut ws, "alice").await;

    // Same user again is accepted silently
    register(&mut ws, "alice").await;

    send(
        &mut ws,
        &ClientEvent::Register {
            user_id: UserId::from("mallory"),
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, 5),
        other => panic!("expected conflict, got {other:?}"),
    }

    controller.cancel();
}

#[tokio::test]
async fn test_leave_after_reconnect_reaches_members() {
    let (addr, controller) = start_relay().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;
    let call_id = two_party_call(&mut alice, &mut bob, CallType::Voice).await;

    // Bob's link drops; the left-call he queued meanwhile arrives right
    // after he registers again
    drop(bob);
    let mut bob = connect(addr).await;
    send(
        &mut bob,
        &ClientEvent::Register {
            user_id: UserId::from("bob"),
        },
    )
    .await;
    send(&mut bob, &ClientEvent::LeftCall { call_id }).await;

    let left = recv_until(&mut alice, |e| matches!(e, ServerEvent::ParticipantLeft { .. })).await;
    assert_eq!(
        left,
        ServerEvent::ParticipantLeft {
            call_id,
            user_id: UserId::from("bob"),
        }
    );
    let ended = recv_until(&mut alice, |e| matches!(e, ServerEvent::CallEnded { .. })).await;
    assert_eq!(ended, ServerEvent::CallEnded { call_id });

    controller.cancel();
}

#[tokio::test]
async fn test_rejoin_after_reconnect_receives_roster() {
    let (addr, controller) = start_relay().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;
    let call_id = two_party_call(&mut alice, &mut bob, CallType::Huddle).await;

    drop(bob);
    let mut bob = connect(addr).await;
    register(&mut bob, "bob").await;
    send(&mut bob, &ClientEvent::JoinedCall { call_id }).await;

    match recv_until(&mut bob, |e| matches!(e, ServerEvent::CallRoster { .. })).await {
        ServerEvent::CallRoster {
            call_id: id,
            participants,
        } => {
            assert_eq!(id, call_id);
            let ids: Vec<UserId> = participants.into_iter().map(|p| p.user_id).collect();
            assert_eq!(ids, vec![UserId::from("alice"), UserId::from("bob")]);
        }
        other => panic!("unexpected {other:?}"),
    }

    controller.cancel();
}

#[tokio::test]
async fn test_join_for_finished_call_gets_call_ended() {
    let (addr, controller) = start_relay().await;
    let mut alice = connect(addr).await;
    register(&mut alice, "alice").await;

    let call_id = CallId::new();
    send(&mut alice, &ClientEvent::JoinedCall { call_id }).await;

    assert_eq!(recv(&mut alice).await, ServerEvent::CallEnded { call_id });

    controller.cancel();
}
