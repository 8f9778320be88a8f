//! Media tracks and streams.
//!
//! A `MediaTrack` is a shared reference to one capture or remote track.
//! Clones refer to the same track: enabling, disabling or stopping through
//! any clone is visible through all of them, and `same_track` compares
//! identity rather than contents.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    /// Received from a remote peer.
    Remote,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Shared handle to one media track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// New live, enabled track with a random id.
    #[must_use]
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, source)
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute. Has no effect on a stopped track.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_stopped() {
            self.inner.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    /// Stop capture. Idempotent; a stopped track is also disabled.
    pub fn stop(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.ended.send_replace(true);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has stopped, whether through `stop` or
    /// because the platform ended it (e.g. the OS "stop sharing" control).
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // The sender lives in `inner`, so the channel cannot close here
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Reference identity.
    #[must_use]
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Locally captured microphone and (optionally) camera tracks.
#[derive(Debug, Clone)]
pub struct LocalStream {
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    #[must_use]
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// True when every track has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }
}

/// Media received from one remote peer.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl RemoteStream {
    #[must_use]
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clones_share_state() {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone);
        let clone = track.clone();

        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.same_track(&clone));

        let other = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone);
        assert!(!track.same_track(&other));
    }

    #[test]
    fn test_stop_disables_and_sticks() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Camera);
        track.stop();
        assert!(track.is_stopped());
        assert!(!track.is_enabled());

        track.set_enabled(true);
        assert!(!track.is_enabled(), "stopped track cannot be re-enabled");

        // Idempotent
        track.stop();
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_ended_resolves_on_stop() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen);
        let watcher = track.clone();
        let waiter = tokio::spawn(async move { watcher.ended().await });

        track.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("ended() resolves")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ended_resolves_immediately_when_already_stopped() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen);
        track.stop();
        tokio::time::timeout(Duration::from_secs(1), track.ended())
            .await
            .expect("ended() resolves");
    }

    #[test]
    fn test_local_stream_accessors() {
        let audio = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone);
        let video = MediaTrack::new(TrackKind::Video, TrackSource::Camera);
        let stream = LocalStream::new(vec![audio.clone(), video.clone()]);

        assert!(stream.audio_track().unwrap().same_track(&audio));
        assert!(stream.video_track().unwrap().same_track(&video));

        stream.stop_all();
        assert!(stream.is_stopped());
        assert!(audio.is_stopped() && video.is_stopped());
    }
}
