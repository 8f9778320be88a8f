//! `HttpCallApi` against a mock REST server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use call_client::api::{CallApi, HttpCallApi, StartCallRequest};
use call_client::errors::CallError;
use chrono::Utc;
use common::types::{CallId, CallType, ChannelId, UserId, WorkspaceId};
use secrecy::SecretString;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, token: Option<&str>) -> HttpCallApi {
    HttpCallApi::new(
        server.uri(),
        token.map(|t| SecretString::from(t.to_string())),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn call_json(call_id: CallId) -> serde_json::Value {
    json!({
        "id": call_id,
        "channelId": "c1",
        "workspaceId": "w1",
        "type": "video",
        "initiator": "u1",
        "createdAt": Utc::now(),
    })
}

#[tokio::test]
async fn test_start_call_posts_request_with_bearer_token() {
    let server = MockServer::start().await;
    let call_id = CallId::new();

    Mock::given(method("POST"))
        .and(path("/calls/start"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_json(json!({
            "channelId": "c1",
            "workspaceId": "w1",
            "type": "video",
            "participants": ["u2", "u3"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(call_json(call_id)))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, Some("secret-token"));
    let call = api
        .start_call(&StartCallRequest {
            channel_id: ChannelId::from("c1"),
            workspace_id: WorkspaceId::from("w1"),
            call_type: CallType::Video,
            participants: vec![UserId::from("u2"), UserId::from("u3")],
        })
        .await
        .unwrap();

    assert_eq!(call.id, call_id);
    assert_eq!(call.call_type, CallType::Video);
    assert_eq!(call.initiator, UserId::from("u1"));
}

#[tokio::test]
async fn test_join_call_returns_roster() {
    let server = MockServer::start().await;
    let call_id = CallId::new();

    Mock::given(method("POST"))
        .and(path(format!("/calls/{call_id}/join")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "call": call_json(call_id),
            "participants": [
                {"userId": "u1", "joinedAt": "2024-05-01T10:00:00Z"},
                {"userId": "u3", "joinedAt": "2024-05-01T10:00:05Z", "videoEnabled": false},
            ],
        })))
        .mount(&server)
        .await;

    let joined = client(&server, None).join_call(call_id).await.unwrap();

    assert_eq!(joined.call.id, call_id);
    assert_eq!(joined.participants.len(), 2);
    let second = joined.participants.get(1).unwrap();
    assert_eq!(second.user_id, UserId::from("u3"));
    assert!(!second.video_enabled);
    assert!(second.audio_enabled);
}

#[tokio::test]
async fn test_leave_call() {
    let server = MockServer::start().await;
    let call_id = CallId::new();

    Mock::given(method("POST"))
        .and(path(format!("/calls/{call_id}/leave")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client(&server, None).leave_call(call_id).await.unwrap();
}

#[tokio::test]
async fn test_not_found_maps_to_call_not_found() {
    let server = MockServer::start().await;
    let call_id = CallId::new();

    Mock::given(method("POST"))
        .and(path(format!("/calls/{call_id}/join")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client(&server, None).join_call(call_id).await.unwrap_err();
    assert!(matches!(err, CallError::CallNotFound(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unauthorized_maps_to_api_error() {
    let server = MockServer::start().await;
    let call_id = CallId::new();

    Mock::given(method("POST"))
        .and(path(format!("/calls/{call_id}/leave")))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client(&server, Some("expired")).leave_call(call_id).await.unwrap_err();
    assert_eq!(err, CallError::Api("not authorized".to_string()));
}

#[tokio::test]
async fn test_server_error_hides_details() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/calls/start"))
        .respond_with(ResponseTemplate::new(503).set_body_string("db pool exhausted"))
        .mount(&server)
        .await;

    let err = client(&server, None)
        .start_call(&StartCallRequest {
            channel_id: ChannelId::from("c1"),
            workspace_id: WorkspaceId::from("w1"),
            call_type: CallType::Voice,
            participants: vec![],
        })
        .await
        .unwrap_err();

    assert_eq!(err, CallError::Api("call service is unavailable".to_string()));
    assert!(!err.client_message().contains("db pool"));
}

#[tokio::test]
async fn test_malformed_body_is_api_error() {
    let server = MockServer::start().await;
    let call_id = CallId::new();

    Mock::given(method("POST"))
        .and(path(format!("/calls/{call_id}/join")))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = client(&server, None).join_call(call_id).await.unwrap_err();
    assert_eq!(
        err,
        CallError::Api("invalid response from call service".to_string())
    );
}

#[tokio::test]
async fn test_unreachable_service() {
    let api = HttpCallApi::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();

    let err = api.leave_call(CallId::new()).await.unwrap_err();
    assert!(matches!(err, CallError::Api(_)));
}
