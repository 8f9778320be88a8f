//! Signaling channel: the client's bidirectional event link to the relay.
//!
//! The session actor is the only subscriber. It sends `ClientEvent`s and
//! receives `ChannelEvent`s, which wrap inbound `ServerEvent`s together with
//! transport state changes.

pub mod ws;

pub use ws::WsSignalingChannel;

use common::protocol::{ClientEvent, ServerEvent};
use common::types::UserId;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default upper bound on the reconnect delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What the channel delivers to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(ServerEvent),
    /// The transport dropped. Outbound events are discarded until reconnect.
    Disconnected,
    /// The transport is back and registration has been re-sent.
    Reconnected,
}

/// Event link to the relay.
pub trait SignalingChannel: Send + Sync {
    /// Announce presence for `user_id`. Re-registering the same user is a
    /// no-op; after a reconnect the channel re-registers on its own.
    fn register(&self, user_id: UserId);

    /// Fire-and-forget send.
    fn send(&self, event: ClientEvent);

    /// Start receiving events. A new subscription closes the previous one.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent>;
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (0-based): `initial`
    /// doubled per attempt, capped at `max`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let backoff = BackoffConfig {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_default() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial, DEFAULT_INITIAL_BACKOFF);
        assert_eq!(backoff.max, DEFAULT_MAX_BACKOFF);
    }
}
