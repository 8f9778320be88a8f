//! Peer connection pool.
//!
//! One entry per remote participant, each wrapping a connection from the
//! WebRTC engine (behind `PeerConnectionFactory`). The pool decides when
//! connections exist; the engine owns negotiation.
//!
//! Engine callbacks arrive as `PeerEventEnvelope`s on the session mailbox,
//! tagged with the entry's generation. Replacing or destroying an entry bumps
//! the generation, so late events from a dead connection are ignored.
//!
//! A failed connection removes only its own entry. The call carries on with
//! the remaining peers.

use crate::errors::{CallError, PeerError};
use crate::media::{LocalStream, MediaDeviceController, MediaTrack, RemoteStream};

use common::types::UserId;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the engine needs to build one connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub remote: UserId,
    /// Whether this side makes the offer.
    pub initiator: bool,
    /// Local stream the connection sends.
    pub stream: LocalStream,
    /// Outbound video (camera or screen), if any.
    pub outbound_video: Option<MediaTrack>,
}

/// Callback events from the engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Locally generated negotiation data for the remote side.
    Signal(Value),
    RemoteStream(RemoteStream),
    Connected,
    Closed,
    Error(String),
}

/// A `PeerEvent` tagged with its origin.
#[derive(Debug, Clone)]
pub struct PeerEventEnvelope {
    pub user_id: UserId,
    pub generation: u64,
    pub event: PeerEvent,
}

/// Where the engine delivers events for one connection.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    user_id: UserId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns `false` once the session is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerEventEnvelope {
                user_id: self.user_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// WebRTC engine entry point.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: PeerConfig,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, PeerError>;
}

/// One engine connection.
pub trait PeerConnection: Send {
    /// Apply remote negotiation data.
    fn signal(&mut self, data: Value) -> Result<(), PeerError>;

    /// Swap the outbound video track. `None` sends no video.
    fn replace_video_track(&mut self, track: Option<MediaTrack>) -> Result<(), PeerError>;

    /// Tear down. Idempotent.
    fn close(&mut self);
}

/// One remote participant's connection.
pub struct PeerConnectionEntry {
    user_id: UserId,
    initiator: bool,
    generation: u64,
    connected: bool,
    connection: Box<dyn PeerConnection>,
    remote_stream: Option<RemoteStream>,
}

impl PeerConnectionEntry {
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn initiator(&self) -> bool {
        self.initiator
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }
}

impl fmt::Debug for PeerConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionEntry")
            .field("user_id", &self.user_id)
            .field("initiator", &self.initiator)
            .field("generation", &self.generation)
            .field("connected", &self.connected)
            .field("has_remote_stream", &self.remote_stream.is_some())
            .finish_non_exhaustive()
    }
}

/// What the session should do after a peer event.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerOutcome {
    /// Stale or unknown; nothing to do.
    Ignored,
    /// Forward negotiation data to `to` over signaling.
    Outbound { to: UserId, signal: Value },
    StreamAdded(UserId),
    Connected(UserId),
    /// The connection closed and its entry was evicted.
    Closed(UserId),
    /// The connection failed and its entry was evicted.
    Failed(CallError),
}

/// Table of live peer connections, at most one per remote user.
pub struct PeerConnectionPool {
    factory: Arc<dyn PeerConnectionFactory>,
    events: mpsc::UnboundedSender<PeerEventEnvelope>,
    entries: HashMap<UserId, PeerConnectionEntry>,
    next_generation: u64,
}

impl PeerConnectionPool {
    #[must_use]
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        events: mpsc::UnboundedSender<PeerEventEnvelope>,
    ) -> Self {
        Self {
            factory,
            events,
            entries: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Create a connection to `remote` seeded with the local stream.
    ///
    /// Any existing entry for `remote` is destroyed first.
    ///
    /// # Errors
    ///
    /// - `CallError::NoLocalStream` if no local stream is held
    /// - `CallError::PeerConnectionFailure` if the engine refuses
    pub fn create(
        &mut self,
        remote: UserId,
        initiator: bool,
        media: &MediaDeviceController,
    ) -> Result<&PeerConnectionEntry, CallError> {
        let stream = media.stream().cloned().ok_or(CallError::NoLocalStream)?;

        self.destroy(&remote);

        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = PeerEventSink {
            user_id: remote.clone(),
            generation,
            tx: self.events.clone(),
        };
        let config = PeerConfig {
            remote: remote.clone(),
            initiator,
            stream,
            outbound_video: media.outbound_video_track(),
        };

        let connection = self.factory.create(config, sink).map_err(|e| {
            warn!(
                target: "client.peer",
                user_id = %remote,
                error = %e,
                "Peer connection creation failed"
            );
            e.for_peer(&remote)
        })?;

        info!(
            target: "client.peer",
            user_id = %remote,
            initiator,
            generation,
            "Peer connection created"
        );

        let entry = PeerConnectionEntry {
            user_id: remote.clone(),
            initiator,
            generation,
            connected: false,
            connection,
            remote_stream: None,
        };
        Ok(self.entries.entry(remote).or_insert(entry))
    }

    /// Deliver remote negotiation data, creating a non-initiator entry for
    /// an unknown peer first.
    ///
    /// # Errors
    ///
    /// Creation errors as for `create`. A signal the engine rejects evicts
    /// the entry and returns `CallError::PeerConnectionFailure`.
    pub fn signal(
        &mut self,
        remote: &UserId,
        data: Value,
        media: &MediaDeviceController,
    ) -> Result<(), CallError> {
        if !self.entries.contains_key(remote) {
            debug!(
                target: "client.peer",
                user_id = %remote,
                "Signal from unknown peer, accepting connection"
            );
            self.create(remote.clone(), false, media)?;
        }

        let Some(entry) = self.entries.get_mut(remote) else {
            return Err(CallError::Internal(format!("peer entry for {remote} missing")));
        };

        if let Err(e) = entry.connection.signal(data) {
            warn!(
                target: "client.peer",
                user_id = %remote,
                error = %e,
                "Peer rejected signal, evicting"
            );
            self.destroy(remote);
            return Err(e.for_peer(remote));
        }
        Ok(())
    }

    /// Close one connection and drop its remote stream.
    pub fn destroy(&mut self, remote: &UserId) -> bool {
        match self.entries.remove(remote) {
            Some(mut entry) => {
                entry.connection.close();
                debug!(
                    target: "client.peer",
                    user_id = %remote,
                    generation = entry.generation,
                    "Peer connection destroyed"
                );
                true
            }
            None => false,
        }
    }

    /// Close every connection. Idempotent.
    pub fn destroy_all(&mut self) {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.connection.close();
        }
        if count > 0 {
            info!(target: "client.peer", count, "All peer connections destroyed");
        }
    }

    /// Apply an engine event.
    pub fn handle_event(&mut self, envelope: PeerEventEnvelope) -> PeerOutcome {
        let PeerEventEnvelope {
            user_id,
            generation,
            event,
        } = envelope;

        let Some(entry) = self.entries.get_mut(&user_id) else {
            debug!(target: "client.peer", user_id = %user_id, "Event for unknown peer ignored");
            return PeerOutcome::Ignored;
        };
        if entry.generation != generation {
            debug!(
                target: "client.peer",
                user_id = %user_id,
                generation,
                current = entry.generation,
                "Stale peer event ignored"
            );
            return PeerOutcome::Ignored;
        }

        match event {
            PeerEvent::Signal(signal) => PeerOutcome::Outbound {
                to: user_id,
                signal,
            },
            PeerEvent::RemoteStream(stream) => {
                debug!(
                    target: "client.peer",
                    user_id = %user_id,
                    stream_id = %stream.id(),
                    "Remote stream added"
                );
                entry.remote_stream = Some(stream);
                PeerOutcome::StreamAdded(user_id)
            }
            PeerEvent::Connected => {
                entry.connected = true;
                PeerOutcome::Connected(user_id)
            }
            PeerEvent::Closed => {
                self.destroy(&user_id);
                PeerOutcome::Closed(user_id)
            }
            PeerEvent::Error(reason) => {
                warn!(
                    target: "client.peer",
                    user_id = %user_id,
                    reason = %reason,
                    "Peer connection failed"
                );
                self.destroy(&user_id);
                PeerOutcome::Failed(CallError::PeerConnectionFailure { user_id, reason })
            }
        }
    }

    /// Swap the outbound video track on every entry. Returns how many
    /// entries accepted the new track.
    pub fn replace_video_track_all(&mut self, track: Option<&MediaTrack>) -> usize {
        let mut replaced = 0;
        for entry in self.entries.values_mut() {
            match entry.connection.replace_video_track(track.cloned()) {
                Ok(()) => replaced += 1,
                Err(e) => warn!(
                    target: "client.peer",
                    user_id = %entry.user_id,
                    error = %e,
                    "Failed to replace outbound video track"
                ),
            }
        }
        replaced
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.entries.contains_key(user_id)
    }

    #[must_use]
    pub fn entry(&self, user_id: &UserId) -> Option<&PeerConnectionEntry> {
        self.entries.get(user_id)
    }

    #[must_use]
    pub fn remote_stream(&self, user_id: &UserId) -> Option<&RemoteStream> {
        self.entries.get(user_id).and_then(|e| e.remote_stream.as_ref())
    }

    pub fn entries(&self) -> impl Iterator<Item = &PeerConnectionEntry> {
        self.entries.values()
    }
}

impl Drop for PeerConnectionPool {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{MediaDevices, TrackKind, TrackSource};
    use crate::testing::{FakeMediaDevices, FakePeerFactory};
    use common::types::CallType;
    use serde_json::json;

    struct Fixture {
        pool: PeerConnectionPool,
        factory: Arc<FakePeerFactory>,
        media: MediaDeviceController,
        events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    }

    async fn fixture() -> Fixture {
        let factory = Arc::new(FakePeerFactory::new());
        let (tx, events) = mpsc::unbounded_channel();
        let pool = PeerConnectionPool::new(
            Arc::clone(&factory) as Arc<dyn PeerConnectionFactory>,
            tx,
        );
        let devices: Arc<dyn MediaDevices> = Arc::new(FakeMediaDevices::new());
        let mut media = MediaDeviceController::new(devices);
        media.acquire(CallType::Video).await.unwrap();
        Fixture {
            pool,
            factory,
            media,
            events,
        }
    }

    fn u(id: &str) -> UserId {
        UserId::from(id)
    }

    #[tokio::test]
    async fn test_create_requires_local_stream() {
        let factory = Arc::new(FakePeerFactory::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = PeerConnectionPool::new(factory as Arc<dyn PeerConnectionFactory>, tx);
        let media = MediaDeviceController::new(Arc::new(FakeMediaDevices::new()));

        let err = pool.create(u("u2"), true, &media).unwrap_err();
        assert_eq!(err, CallError::NoLocalStream);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_create_seeds_connection_with_local_stream() {
        let mut f = fixture().await;

        let entry = f.pool.create(u("u2"), true, &f.media).unwrap();
        assert!(entry.initiator());
        assert_eq!(entry.user_id(), &u("u2"));

        let conn = f.factory.connection_for(&u("u2")).unwrap();
        assert!(conn.initiator());
        assert!(conn
            .video_track()
            .unwrap()
            .same_track(f.media.stream().unwrap().video_track().unwrap()));
    }

    #[tokio::test]
    async fn test_at_most_one_entry_per_user() {
        let mut f = fixture().await;

        let first_gen = f.pool.create(u("u2"), true, &f.media).unwrap().generation();
        let second_gen = f.pool.create(u("u2"), false, &f.media).unwrap().generation();
        f.pool.create(u("u3"), true, &f.media).unwrap();
        f.pool.destroy(&u("u3"));
        f.pool.create(u("u3"), true, &f.media).unwrap();

        assert_eq!(f.pool.len(), 2);
        assert!(second_gen > first_gen);
        assert_eq!(f.factory.live_count(&u("u2")), 1);
        assert_eq!(f.factory.live_count(&u("u3")), 1);
        assert_eq!(f.factory.created_count(), 4);
    }

    #[tokio::test]
    async fn test_signal_from_unknown_peer_creates_receiver_entry() {
        let mut f = fixture().await;
        let offer = json!({"type": "offer", "sdp": "v=0"});

        f.pool.signal(&u("u4"), offer.clone(), &f.media).unwrap();

        let entry = f.pool.entry(&u("u4")).unwrap();
        assert!(!entry.initiator());
        let conn = f.factory.connection_for(&u("u4")).unwrap();
        assert_eq!(conn.signals_received(), vec![offer]);
    }

    #[tokio::test]
    async fn test_signal_to_known_peer_reuses_entry() {
        let mut f = fixture().await;
        f.pool.create(u("u2"), true, &f.media).unwrap();

        let answer = json!({"type": "answer"});
        f.pool.signal(&u("u2"), answer.clone(), &f.media).unwrap();

        assert_eq!(f.factory.created_count(), 1);
        assert!(f.pool.entry(&u("u2")).unwrap().initiator());
        assert_eq!(
            f.factory.connection_for(&u("u2")).unwrap().signals_received(),
            vec![answer]
        );
    }

    #[tokio::test]
    async fn test_rejected_signal_evicts_entry() {
        let mut f = fixture().await;
        f.pool.create(u("u2"), true, &f.media).unwrap();
        f.factory.connection_for(&u("u2")).unwrap().reject_signals();

        let err = f
            .pool
            .signal(&u("u2"), json!({"candidate": "x"}), &f.media)
            .unwrap_err();
        assert!(matches!(err, CallError::PeerConnectionFailure { .. }));
        assert!(!f.pool.contains(&u("u2")));
    }

    #[tokio::test]
    async fn test_error_event_evicts_only_that_peer() {
        let mut f = fixture().await;
        f.pool.create(u("u2"), true, &f.media).unwrap();
        f.pool.create(u("u3"), true, &f.media).unwrap();

        f.factory
            .connection_for(&u("u2"))
            .unwrap()
            .emit(PeerEvent::Error("ice failed".to_string()));
        let envelope = f.events.recv().await.unwrap();

        let outcome = f.pool.handle_event(envelope);
        assert!(matches!(
            outcome,
            PeerOutcome::Failed(CallError::PeerConnectionFailure { ref user_id, .. }) if user_id == &u("u2")
        ));
        assert!(!f.pool.contains(&u("u2")));
        assert!(f.pool.contains(&u("u3")));
        assert!(f.factory.connection_for(&u("u2")).unwrap().is_closed());
        assert!(!f.factory.connection_for(&u("u3")).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let mut f = fixture().await;
        f.pool.create(u("u2"), true, &f.media).unwrap();
        let old = f.factory.connection_for(&u("u2")).unwrap();
        f.pool.create(u("u2"), true, &f.media).unwrap();

        old.emit(PeerEvent::Error("late failure".to_string()));
        let envelope = f.events.recv().await.unwrap();

        assert_eq!(f.pool.handle_event(envelope), PeerOutcome::Ignored);
        assert!(f.pool.contains(&u("u2")));
    }

    #[tokio::test]
    async fn test_signal_event_becomes_outbound() {
        let mut f = fixture().await;
        f.pool.create(u("u2"), true, &f.media).unwrap();
        let offer = json!({"type": "offer"});

        f.factory
            .connection_for(&u("u2"))
            .unwrap()
            .emit(PeerEvent::Signal(offer.clone()));
        let envelope = f.events.recv().await.unwrap();

        assert_eq!(
            f.pool.handle_event(envelope),
            PeerOutcome::Outbound {
                to: u("u2"),
                signal: offer,
            }
        );
    }

    #[tokio::test]
    async fn test_remote_stream_registered_and_dropped_on_destroy() {
        let mut f = fixture().await;
        f.pool.create(u("u2"), true, &f.media).unwrap();

        let remote = RemoteStream::new(
            "remote-1",
            vec![MediaTrack::new(TrackKind::Audio, TrackSource::Remote)],
        );
        f.factory
            .connection_for(&u("u2"))
            .unwrap()
            .emit(PeerEvent::RemoteStream(remote));
        let envelope = f.events.recv().await.unwrap();

        assert_eq!(
            f.pool.handle_event(envelope),
            PeerOutcome::StreamAdded(u("u2"))
        );
        assert_eq!(f.pool.remote_stream(&u("u2")).unwrap().id(), "remote-1");

        assert!(f.pool.destroy(&u("u2")));
        assert!(f.pool.remote_stream(&u("u2")).is_none());
        assert!(!f.pool.destroy(&u("u2")));
    }

    #[tokio::test]
    async fn test_destroy_all_is_idempotent() {
        let mut f = fixture().await;
        f.pool.create(u("u2"), true, &f.media).unwrap();
        f.pool.create(u("u3"), false, &f.media).unwrap();

        f.pool.destroy_all();
        assert!(f.pool.is_empty());
        assert!(f.factory.connection_for(&u("u2")).unwrap().is_closed());
        assert!(f.factory.connection_for(&u("u3")).unwrap().is_closed());

        f.pool.destroy_all();
        assert!(f.pool.is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_entry() {
        let mut f = fixture().await;
        f.factory.fail_next_create();

        let err = f.pool.create(u("u2"), true, &f.media).unwrap_err();
        assert!(matches!(err, CallError::PeerConnectionFailure { .. }));
        assert!(f.pool.is_empty());
    }
}
