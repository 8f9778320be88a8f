//! Error types for the call client.
//!
//! `CallError` is what the session handle returns and what notices carry.
//! `MediaError` and `PeerError` are the collaborator-level errors reported by
//! capture devices and the peer engine; both convert into `CallError`.

use crate::session::CallState;

use common::types::UserId;
use thiserror::Error;

/// Call client error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Capture device permission refused or device unavailable.
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// One peer's negotiation or transport failed. The call continues.
    #[error("Peer connection to {user_id} failed: {reason}")]
    PeerConnectionFailure { user_id: UserId, reason: String },

    /// Signaling transport failure.
    #[error("Signaling channel error: {0}")]
    SignalingChannel(String),

    /// The call API reports no such call.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// A peer connection was requested before local media was acquired.
    #[error("No local media stream")]
    NoLocalStream,

    /// The operation is not valid in the current call state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    /// The call API rejected the request or is unreachable.
    #[error("Call API error: {0}")]
    Api(String),

    /// The operation was superseded by a leave.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// User-safe description.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CallError::MediaAccessDenied(_) => {
                "Camera or microphone access was denied".to_string()
            }
            CallError::PeerConnectionFailure { user_id, .. } => {
                format!("Connection problem with {user_id}")
            }
            CallError::SignalingChannel(_) => "Lost connection to the call service".to_string(),
            CallError::CallNotFound(_) => "This call no longer exists".to_string(),
            CallError::NoLocalStream | CallError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            CallError::InvalidState { operation, state } => {
                format!("Cannot {operation} while {state}")
            }
            CallError::Api(_) => "The call service is unavailable".to_string(),
            CallError::Cancelled => "The operation was cancelled".to_string(),
        }
    }

    /// Whether the error ends the call (as opposed to a per-peer or
    /// per-operation problem).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::MediaAccessDenied(_)
                | CallError::SignalingChannel(_)
                | CallError::CallNotFound(_)
                | CallError::Api(_)
                | CallError::Internal(_)
        )
    }
}

/// Errors reported by capture devices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The user or the OS refused access.
    #[error("permission denied: {0}")]
    Denied(String),

    /// No usable device.
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        CallError::MediaAccessDenied(err.to_string())
    }
}

/// Errors reported by the peer connection engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("failed to create peer connection: {0}")]
    Create(String),

    #[error("failed to apply signal: {0}")]
    Signal(String),

    #[error("failed to replace track: {0}")]
    ReplaceTrack(String),
}

impl PeerError {
    /// Attach the remote user to make a `CallError`.
    #[must_use]
    pub fn for_peer(self, user_id: &UserId) -> CallError {
        CallError::PeerConnectionFailure {
            user_id: user_id.clone(),
            reason: self.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_errors_map_to_access_denied() {
        let err: CallError = MediaError::Denied("user dismissed prompt".to_string()).into();
        assert!(matches!(err, CallError::MediaAccessDenied(_)));

        let err: CallError = MediaError::Unavailable("no camera".to_string()).into();
        assert!(matches!(err, CallError::MediaAccessDenied(_)));
    }

    #[test]
    fn test_peer_failure_is_not_fatal() {
        let err = PeerError::Signal("ice failed".to_string()).for_peer(&UserId::from("u2"));
        assert!(!err.is_fatal());
        assert_eq!(err.client_message(), "Connection problem with u2");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CallError::MediaAccessDenied("x".to_string()).is_fatal());
        assert!(CallError::CallNotFound("x".to_string()).is_fatal());
        assert!(CallError::SignalingChannel("x".to_string()).is_fatal());
        assert!(!CallError::Cancelled.is_fatal());
        assert!(!CallError::InvalidState {
            operation: "accept a call",
            state: CallState::Idle,
        }
        .is_fatal());
    }

    #[test]
    fn test_client_messages_hide_internals() {
        let err = CallError::Api("connection refused to 10.0.0.3:8443".to_string());
        assert!(!err.client_message().contains("10.0.0.3"));

        let err = CallError::Internal("mailbox closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = CallError::InvalidState {
            operation: "start a call",
            state: CallState::Active,
        };
        assert_eq!(err.to_string(), "Cannot start a call while active");
    }
}
