//! Presence registry: which connection currently speaks for each user.
//!
//! Written by the controller (register, disconnect), read by call actors to
//! deliver events. A user has at most one live connection.

use crate::actors::ConnectionActorHandle;

use common::protocol::ServerEvent;
use common::types::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Shared map of online users to their connection actors.
#[derive(Clone, Debug, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<HashMap<UserId, ConnectionActorHandle>>>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `connection`, returning the previous connection if
    /// it was a different one.
    pub async fn bind(
        &self,
        user_id: UserId,
        connection: ConnectionActorHandle,
    ) -> Option<ConnectionActorHandle> {
        let mut map = self.inner.write().await;
        let previous = map.insert(user_id, connection.clone());
        previous.filter(|old| old.connection_id() != connection.connection_id())
    }

    /// Remove the binding only if `connection_id` is still current.
    ///
    /// Returns `true` when the binding was removed. A stale close (the user
    /// already reconnected on a newer socket) leaves the registry untouched.
    pub async fn unbind(&self, user_id: &UserId, connection_id: &str) -> bool {
        let mut map = self.inner.write().await;
        let is_current = map
            .get(user_id)
            .is_some_and(|c| c.connection_id() == connection_id);
        if is_current {
            map.remove(user_id);
        }
        is_current
    }

    /// Deliver `event` to `user_id` if online. Returns whether it was queued.
    pub async fn send_to(&self, user_id: &UserId, event: ServerEvent) -> bool {
        let connection = self.inner.read().await.get(user_id).cloned();
        match connection {
            Some(conn) => conn.send(event).await.is_ok(),
            None => {
                debug!(
                    target: "relay.presence",
                    user_id = %user_id,
                    event = event.name(),
                    "User offline, event not delivered"
                );
                false
            }
        }
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.read().await.contains_key(user_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove every binding, returning the handles so they can be closed.
    pub async fn drain(&self) -> Vec<ConnectionActorHandle> {
        self.inner.write().await.drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ConnectionActor, RelayMetrics};
    use common::types::CallId;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn connection(id: &str) -> (ConnectionActorHandle, mpsc::Receiver<String>) {
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (handle, _task) = ConnectionActor::spawn(
            id.to_string(),
            frames_tx,
            CancellationToken::new(),
            RelayMetrics::new(),
        );
        (handle, frames_rx)
    }

    #[tokio::test]
    async fn test_bind_returns_replaced_connection() {
        let presence = PresenceRegistry::new();
        let alice = UserId::from("alice");
        let (first, _rx1) = connection("conn-1");
        let (second, _rx2) = connection("conn-2");

        assert!(presence.bind(alice.clone(), first.clone()).await.is_none());
        // Same connection again is not a replacement
        assert!(presence.bind(alice.clone(), first).await.is_none());

        let replaced = presence.bind(alice.clone(), second).await.unwrap();
        assert_eq!(replaced.connection_id(), "conn-1");
        assert_eq!(presence.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_unbind_is_ignored() {
        let presence = PresenceRegistry::new();
        let alice = UserId::from("alice");
        let (first, _rx1) = connection("conn-1");
        let (second, _rx2) = connection("conn-2");

        presence.bind(alice.clone(), first).await;
        presence.bind(alice.clone(), second).await;

        assert!(!presence.unbind(&alice, "conn-1").await);
        assert!(presence.is_online(&alice).await);

        assert!(presence.unbind(&alice, "conn-2").await);
        assert!(presence.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_to_online_and_offline_users() {
        let presence = PresenceRegistry::new();
        let alice = UserId::from("alice");
        let (conn, mut frames) = connection("conn-1");
        presence.bind(alice.clone(), conn).await;

        let call_id = CallId::new();
        assert!(presence.send_to(&alice, ServerEvent::CallEnded { call_id }).await);
        let frame = frames.recv().await.unwrap();
        assert_eq!(
            ServerEvent::decode(&frame).unwrap(),
            ServerEvent::CallEnded { call_id }
        );

        assert!(
            !presence
                .send_to(&UserId::from("bob"), ServerEvent::CallEnded { call_id })
                .await
        );
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let presence = PresenceRegistry::new();
        let (a, _rx1) = connection("conn-1");
        let (b, _rx2) = connection("conn-2");
        presence.bind(UserId::from("alice"), a).await;
        presence.bind(UserId::from("bob"), b).await;

        let drained = presence.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(presence.is_empty().await);
    }
}
