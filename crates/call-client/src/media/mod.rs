//! Local media: capture, track toggles and screen share.
//!
//! `MediaDeviceController` exclusively owns the local stream. The session
//! reads its state and commands it; peer connections only ever see clones of
//! its tracks.
//!
//! Exactly one outbound video track is active at a time: the camera track,
//! or the captured screen track while sharing. Switching between them is
//! applied to every live peer before the switching call returns.

pub mod track;

pub use track::{LocalStream, MediaTrack, RemoteStream, TrackKind, TrackSource};

use crate::errors::{CallError, MediaError};
use crate::peer::PeerConnectionPool;

use async_trait::async_trait;
use common::types::CallType;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Audio processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain_control: true,
        }
    }
}

/// What to capture for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio always; camera only for video calls.
    #[must_use]
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: call_type.wants_video(),
        }
    }
}

/// Platform capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture microphone (and camera if requested).
    async fn get_user_media(&self, constraints: MediaConstraints)
        -> Result<LocalStream, MediaError>;

    /// Ask the user for a screen or window to share.
    async fn get_display_media(&self) -> Result<MediaTrack, MediaError>;
}

/// Snapshot of local media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalMediaState {
    pub has_stream: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// Owner of the local stream and the outbound video track.
pub struct MediaDeviceController {
    devices: Arc<dyn MediaDevices>,
    stream: Option<LocalStream>,
    /// Captured display track while sharing.
    screen_track: Option<MediaTrack>,
    /// Camera track to restore when sharing stops.
    camera_track: Option<MediaTrack>,
}

impl MediaDeviceController {
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: None,
            screen_track: None,
            camera_track: None,
        }
    }

    /// Capture for `call_type` without touching controller state.
    ///
    /// The returned future owns everything it needs, so the session can run
    /// it on a spawned task and `install` the result later.
    pub fn request(
        &self,
        call_type: CallType,
    ) -> impl Future<Output = Result<LocalStream, CallError>> + Send + 'static {
        let devices = Arc::clone(&self.devices);
        async move {
            let constraints = MediaConstraints::for_call(call_type);
            devices
                .get_user_media(constraints)
                .await
                .map_err(CallError::from)
        }
    }

    /// Take ownership of a captured stream. A stream already held is
    /// released first.
    pub fn install(&mut self, stream: LocalStream) -> LocalMediaState {
        if self.stream.is_some() {
            self.release();
        }
        debug!(
            target: "client.media",
            tracks = stream.tracks().len(),
            "Local stream installed"
        );
        self.stream = Some(stream);
        self.state()
    }

    /// Capture and install in one step.
    pub async fn acquire(&mut self, call_type: CallType) -> Result<LocalMediaState, CallError> {
        let stream = self.request(call_type).await?;
        Ok(self.install(stream))
    }

    /// Stop every held track, including any screen track. Idempotent.
    pub fn release(&mut self) {
        let had_stream = self.stream.is_some();

        if let Some(screen) = self.screen_track.take() {
            screen.stop();
        }
        self.camera_track = None;
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }

        if had_stream {
            info!(target: "client.media", "Local media released");
        }
    }

    #[must_use]
    pub fn state(&self) -> LocalMediaState {
        match &self.stream {
            None => LocalMediaState::default(),
            Some(stream) => LocalMediaState {
                has_stream: true,
                audio_enabled: stream.audio_track().is_some_and(MediaTrack::is_enabled),
                video_enabled: stream.video_track().is_some_and(MediaTrack::is_enabled),
                screen_sharing: self.screen_track.is_some(),
            },
        }
    }

    #[must_use]
    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    #[must_use]
    pub fn is_sharing(&self) -> bool {
        self.screen_track.is_some()
    }

    #[must_use]
    pub fn screen_track(&self) -> Option<&MediaTrack> {
        self.screen_track.as_ref()
    }

    /// Flip the microphone. Without a stream, returns the state unchanged.
    pub fn toggle_audio(&mut self) -> LocalMediaState {
        if let Some(track) = self.stream.as_ref().and_then(LocalStream::audio_track) {
            track.set_enabled(!track.is_enabled());
        }
        self.state()
    }

    /// Flip the camera. Without a stream or camera, returns the state
    /// unchanged.
    pub fn toggle_video(&mut self) -> LocalMediaState {
        if let Some(track) = self.stream.as_ref().and_then(LocalStream::video_track) {
            track.set_enabled(!track.is_enabled());
        }
        self.state()
    }

    /// Ask the platform for a display track without touching state.
    pub fn request_display(
        &self,
    ) -> impl Future<Output = Result<MediaTrack, CallError>> + Send + 'static {
        let devices = Arc::clone(&self.devices);
        async move { devices.get_display_media().await.map_err(CallError::from) }
    }

    /// Make `track` the outbound video on every live peer.
    ///
    /// Returns the track so the caller can watch for the platform ending it.
    pub fn begin_screen_share(
        &mut self,
        track: MediaTrack,
        pool: &mut PeerConnectionPool,
    ) -> Result<MediaTrack, CallError> {
        let Some(stream) = self.stream.as_ref() else {
            track.stop();
            return Err(CallError::NoLocalStream);
        };

        match self.screen_track.take() {
            // Already sharing: the remembered camera track stays as is
            Some(previous) => previous.stop(),
            None => self.camera_track = stream.video_track().cloned(),
        }

        let replaced = pool.replace_video_track_all(Some(&track));
        info!(
            target: "client.media",
            track_id = %track.id(),
            peers = replaced,
            "Screen share started"
        );

        self.screen_track = Some(track.clone());
        Ok(track)
    }

    /// Capture a display and share it.
    pub async fn start_screen_share(
        &mut self,
        pool: &mut PeerConnectionPool,
    ) -> Result<MediaTrack, CallError> {
        let track = self.request_display().await?;
        self.begin_screen_share(track, pool)
    }

    /// Restore the camera track on every live peer and stop the screen
    /// track. No-op when not sharing.
    pub fn stop_screen_share(&mut self, pool: &mut PeerConnectionPool) -> LocalMediaState {
        let Some(screen) = self.screen_track.take() else {
            return self.state();
        };

        let camera = self.camera_track.take();
        let replaced = pool.replace_video_track_all(camera.as_ref());
        screen.stop();

        info!(
            target: "client.media",
            track_id = %screen.id(),
            peers = replaced,
            restored_camera = camera.is_some(),
            "Screen share stopped"
        );

        self.state()
    }

    /// The outbound video track new peers should send.
    #[must_use]
    pub fn outbound_video_track(&self) -> Option<MediaTrack> {
        self.screen_track
            .clone()
            .or_else(|| self.stream.as_ref().and_then(LocalStream::video_track).cloned())
    }
}
