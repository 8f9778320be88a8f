//! Relay error types.
//!
//! Error types map to the `code` field of the `error` server event.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Relay error type.
///
/// Maps to `error` event codes:
/// - `InvalidEvent`: `INVALID_REQUEST` (1)
/// - `NotRegistered`: `UNAUTHORIZED` (2)
/// - `NotAMember`: `FORBIDDEN` (3)
/// - `CallNotFound`: `NOT_FOUND` (4)
/// - `Conflict`: `CONFLICT` (5)
/// - Internal, Config: `INTERNAL_ERROR` (6)
/// - `CapacityExceeded`, `Draining`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame could not be decoded into a client event.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Connection sent a call event before `register`.
    #[error("Connection not registered")]
    NotRegistered,

    /// Sender (or signal target) is not part of the call.
    #[error("Not a member of call {0}")]
    NotAMember(String),

    /// Call not found.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Conflict (e.g., call id already in use).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Relay or call is at capacity.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Relay is draining (graceful shutdown).
    #[error("Relay is draining")]
    Draining,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns the `error` event code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RelayError::InvalidEvent(_) => 1,       // INVALID_REQUEST
            RelayError::NotRegistered => 2,         // UNAUTHORIZED
            RelayError::NotAMember(_) => 3,         // FORBIDDEN
            RelayError::CallNotFound(_) => 4,       // NOT_FOUND
            RelayError::Conflict(_) => 5,           // CONFLICT
            RelayError::Config(_) | RelayError::Internal(_) => 6, // INTERNAL_ERROR
            RelayError::CapacityExceeded(_) | RelayError::Draining => 7, // CAPACITY_EXCEEDED
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::InvalidEvent(_) => "Malformed or unknown event".to_string(),
            RelayError::NotRegistered => "Register before sending call events".to_string(),
            RelayError::NotAMember(_) => "Not a member of this call".to_string(),
            RelayError::CallNotFound(_) => "Call not found".to_string(),
            RelayError::Conflict(msg) => msg.clone(),
            RelayError::CapacityExceeded(_) => "Server is at capacity, please try again".to_string(),
            RelayError::Draining => "Server is shutting down, please reconnect".to_string(),
            RelayError::Config(_) | RelayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Label for the `outcome` dimension of routing metrics.
    #[must_use]
    pub const fn metric_label(&self) -> &'static str {
        match self {
            RelayError::InvalidEvent(_) => "invalid_event",
            RelayError::NotRegistered => "not_registered",
            RelayError::NotAMember(_) => "not_a_member",
            RelayError::CallNotFound(_) => "call_not_found",
            RelayError::Conflict(_) => "conflict",
            RelayError::CapacityExceeded(_) => "capacity_exceeded",
            RelayError::Draining => "draining",
            RelayError::Config(_) | RelayError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(RelayError::InvalidEvent("bad".to_string()).error_code(), 1);
        assert_eq!(RelayError::NotRegistered.error_code(), 2);
        assert_eq!(RelayError::NotAMember("c1".to_string()).error_code(), 3);
        assert_eq!(RelayError::CallNotFound("c1".to_string()).error_code(), 4);
        assert_eq!(
            RelayError::Conflict("Call already exists".to_string()).error_code(),
            5
        );
        assert_eq!(RelayError::Internal("oops".to_string()).error_code(), 6);
        assert_eq!(RelayError::Config("bad".to_string()).error_code(), 6);
        assert_eq!(
            RelayError::CapacityExceeded("max calls".to_string()).error_code(),
            7
        );
        assert_eq!(RelayError::Draining.error_code(), 7);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = RelayError::Internal("channel send failed: 10.0.0.4".to_string());
        assert!(!err.client_message().contains("10.0.0.4"));
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = RelayError::CallNotFound("5f0c9d3e".to_string());
        assert!(!err.client_message().contains("5f0c9d3e"));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", RelayError::CallNotFound("abc".to_string())),
            "Call not found: abc"
        );
        assert_eq!(format!("{}", RelayError::Draining), "Relay is draining");
    }
}
