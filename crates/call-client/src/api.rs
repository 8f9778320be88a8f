//! Call REST API client.
//!
//! The REST API owns call records; the client only needs three endpoints:
//!
//! - `POST /calls/start` creates a call and returns the `Call`
//! - `POST /calls/{id}/join` returns the call and its current roster
//! - `POST /calls/{id}/leave`
//!
//! `CallApi` is the seam the session actor depends on; `HttpCallApi` is the
//! reqwest implementation.

use crate::errors::CallError;

use async_trait::async_trait;
use common::types::{Call, CallId, CallParticipant, CallType, ChannelId, UserId, WorkspaceId};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Connect timeout for REST requests.
const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for starting a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    pub channel_id: ChannelId,
    pub workspace_id: WorkspaceId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// Users to invite.
    pub participants: Vec<UserId>,
}

/// Response to a join: the call and everyone already in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedCall {
    pub call: Call,
    pub participants: Vec<CallParticipant>,
}

/// REST operations the session needs (enables mocking).
#[async_trait]
pub trait CallApi: Send + Sync {
    /// Create a call.
    async fn start_call(&self, request: &StartCallRequest) -> Result<Call, CallError>;

    /// Join an existing call.
    async fn join_call(&self, call_id: CallId) -> Result<JoinedCall, CallError>;

    /// Leave a call.
    async fn leave_call(&self, call_id: CallId) -> Result<(), CallError>;
}

/// HTTP client for the call REST API.
#[derive(Clone)]
pub struct HttpCallApi {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpCallApi {
    /// Create a new API client.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Internal` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, CallError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(API_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                error!(target: "client.api", error = %e, "Failed to build HTTP client");
                CallError::Internal("failed to build HTTP client".to_string())
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build from the client configuration.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Internal` if the HTTP client cannot be built.
    pub fn from_config(config: &crate::config::Config) -> Result<Self, CallError> {
        Self::new(
            config.api_base_url.clone(),
            config.api_token.clone(),
            config.api_timeout(),
        )
    }

    async fn post<B, T>(&self, path: &str, body: Option<&B>) -> Result<T, CallError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(path, body).await?;
        response.json().await.map_err(|e| {
            error!(target: "client.api", path = %path, error = %e, "Failed to parse API response");
            CallError::Api("invalid response from call service".to_string())
        })
    }

    async fn send<B>(&self, path: &str, body: Option<&B>) -> Result<reqwest::Response, CallError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let url = format!("{}{path}", self.base_url);

        let mut request = self.client.post(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(target: "client.api", path = %path, error = %e, "Call API request failed");
            CallError::Api("call service is unavailable".to_string())
        })?;

        check_status(path, response).await
    }
}

/// Map non-success status codes to errors.
async fn check_status(path: &str, response: reqwest::Response) -> Result<reqwest::Response, CallError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::NOT_FOUND => {
            debug!(target: "client.api", path = %path, "Call not found");
            Err(CallError::CallNotFound(path.to_string()))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            warn!(target: "client.api", path = %path, status = %status, "Call API rejected credentials");
            Err(CallError::Api("not authorized".to_string()))
        }
        s if s.is_server_error() => {
            warn!(target: "client.api", path = %path, status = %status, "Call API server error");
            Err(CallError::Api("call service is unavailable".to_string()))
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "client.api", path = %path, status = %status, body = %body, "Unexpected call API response");
            Err(CallError::Api(format!("unexpected status {status}")))
        }
    }
}

#[async_trait]
impl CallApi for HttpCallApi {
    #[instrument(skip_all, name = "client.api.start_call", fields(channel_id = %request.channel_id.0))]
    async fn start_call(&self, request: &StartCallRequest) -> Result<Call, CallError> {
        self.post("/calls/start", Some(request)).await
    }

    #[instrument(skip_all, name = "client.api.join_call", fields(call_id = %call_id))]
    async fn join_call(&self, call_id: CallId) -> Result<JoinedCall, CallError> {
        self.post::<(), _>(&format!("/calls/{call_id}/join"), None)
            .await
    }

    #[instrument(skip_all, name = "client.api.leave_call", fields(call_id = %call_id))]
    async fn leave_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.send::<()>(&format!("/calls/{call_id}/leave"), None)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_serialization() {
        let request = StartCallRequest {
            channel_id: ChannelId::from("c1"),
            workspace_id: WorkspaceId::from("w1"),
            call_type: CallType::Video,
            participants: vec![UserId::from("u2"), UserId::from("u3")],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["channelId"], "c1");
        assert_eq!(json["workspaceId"], "w1");
        assert_eq!(json["type"], "video");
        assert_eq!(json["participants"][1], "u3");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = HttpCallApi::new("http://localhost:9000/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url, "http://localhost:9000");
    }
}
