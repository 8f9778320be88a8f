//! Common data types for Callmesh components.
//!
//! These are the records shared by the call client and the signaling relay:
//! identifiers, the `Call` record returned by the REST API, and roster
//! entries. JSON field names are camelCase to match the REST and signaling
//! payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque user identifier, as issued by the identity layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Channel a call is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Workspace a call is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of call. Fixed once the call starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio-only call.
    Voice,
    /// Audio and camera video.
    Video,
    /// Drop-in audio room that stays open with a single member.
    Huddle,
}

impl CallType {
    /// Whether local camera video is captured for this call type.
    #[must_use]
    pub const fn wants_video(&self) -> bool {
        matches!(self, CallType::Video)
    }

    /// Whether the call survives with a single remaining member.
    #[must_use]
    pub const fn persists_alone(&self) -> bool {
        matches!(self, CallType::Huddle)
    }

    /// Returns the call type as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
            CallType::Huddle => "huddle",
        }
    }
}

/// Authoritative record for one call session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Call identifier, assigned at creation.
    pub id: CallId,
    /// Channel the call belongs to.
    pub channel_id: ChannelId,
    /// Workspace the call belongs to.
    pub workspace_id: WorkspaceId,
    /// Voice, video or huddle.
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// User who started the call.
    pub initiator: UserId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One member of a call's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    /// Member identity, unique within a roster.
    pub user_id: UserId,
    /// When the member joined.
    pub joined_at: DateTime<Utc>,
    #[serde(default = "enabled_by_default")]
    pub audio_enabled: bool,
    #[serde(default = "enabled_by_default")]
    pub video_enabled: bool,
    #[serde(default)]
    pub screen_sharing: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl CallParticipant {
    /// New participant that joined now with default media flags.
    #[must_use]
    pub fn joined_now(user_id: UserId) -> Self {
        Self {
            user_id,
            joined_at: Utc::now(),
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_type_video_policy() {
        assert!(CallType::Video.wants_video());
        assert!(!CallType::Voice.wants_video());
        assert!(!CallType::Huddle.wants_video());
        assert!(CallType::Huddle.persists_alone());
        assert!(!CallType::Voice.persists_alone());
    }

    #[test]
    fn test_call_serializes_with_camel_case_fields() {
        let call = Call {
            id: CallId::new(),
            channel_id: ChannelId::from("c1"),
            workspace_id: WorkspaceId::from("w1"),
            call_type: CallType::Video,
            initiator: UserId::from("u1"),
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["channelId"], "c1");
        assert_eq!(json["workspaceId"], "w1");
        assert_eq!(json["type"], "video");
        assert_eq!(json["initiator"], "u1");
    }

    #[test]
    fn test_participant_media_flags_default_when_missing() {
        let json = serde_json::json!({
            "userId": "u2",
            "joinedAt": "2024-05-01T10:00:00Z",
        });

        let participant: CallParticipant = serde_json::from_value(json).unwrap();
        assert_eq!(participant.user_id, UserId::from("u2"));
        assert!(participant.audio_enabled);
        assert!(participant.video_enabled);
        assert!(!participant.screen_sharing);
    }
}
