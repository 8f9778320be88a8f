//! Test doubles for the session's collaborators.
//!
//! Enabled by the `test-utils` feature (and always in this crate's unit
//! tests). Every double records what it was asked to do so tests can assert
//! on it afterwards.

use crate::api::{CallApi, JoinedCall, StartCallRequest};
use crate::errors::{CallError, MediaError, PeerError};
use crate::media::{
    LocalStream, MediaConstraints, MediaDevices, MediaTrack, TrackKind, TrackSource,
};
use crate::peer::{PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink};
use crate::signaling::{ChannelEvent, SignalingChannel};

use async_trait::async_trait;
use chrono::Utc;
use common::protocol::{ClientEvent, ServerEvent};
use common::types::{Call, CallId, CallParticipant, CallType, ChannelId, UserId, WorkspaceId};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `check` until it returns true or about two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Build a `Call` record for tests.
#[must_use]
pub fn test_call(initiator: &str, call_type: CallType) -> Call {
    Call {
        id: CallId::new(),
        channel_id: ChannelId::from("channel-1"),
        workspace_id: WorkspaceId::from("workspace-1"),
        call_type,
        initiator: UserId::from(initiator),
        created_at: Utc::now(),
    }
}

// --- Media devices -------------------------------------------------------

/// Capture devices that hand out fresh in-memory tracks.
pub struct FakeMediaDevices {
    deny_user_media: AtomicBool,
    deny_display_media: AtomicBool,
    /// While true, `get_user_media` waits.
    hold: watch::Sender<bool>,
    constraints: Mutex<Vec<MediaConstraints>>,
    streams: Mutex<Vec<LocalStream>>,
    screens: Mutex<Vec<MediaTrack>>,
}

impl Default for FakeMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMediaDevices {
    #[must_use]
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            deny_user_media: AtomicBool::new(false),
            deny_display_media: AtomicBool::new(false),
            hold,
            constraints: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            screens: Mutex::new(Vec::new()),
        }
    }

    /// Refuse camera and microphone from now on.
    pub fn deny_user_media(&self) {
        self.deny_user_media.store(true, Ordering::SeqCst);
    }

    /// Refuse screen capture from now on (user dismissed the picker).
    pub fn deny_display_media(&self) {
        self.deny_display_media.store(true, Ordering::SeqCst);
    }

    /// Make `get_user_media` wait until `release_user_media`.
    pub fn hold_user_media(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_user_media(&self) {
        self.hold.send_replace(false);
    }

    #[must_use]
    pub fn requested_constraints(&self) -> Vec<MediaConstraints> {
        lock(&self.constraints).clone()
    }

    /// Every stream handed out, oldest first.
    #[must_use]
    pub fn issued_streams(&self) -> Vec<LocalStream> {
        lock(&self.streams).clone()
    }

    /// Every display track handed out, oldest first.
    #[must_use]
    pub fn issued_screens(&self) -> Vec<MediaTrack> {
        lock(&self.screens).clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        lock(&self.constraints).push(constraints);

        let mut hold = self.hold.subscribe();
        let _ = hold.wait_for(|held| !held).await;

        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(MediaError::Denied("permission dismissed".to_string()));
        }

        let mut tracks = vec![MediaTrack::new(TrackKind::Audio, TrackSource::Microphone)];
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, TrackSource::Camera));
        }
        let stream = LocalStream::new(tracks);
        lock(&self.streams).push(stream.clone());
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<MediaTrack, MediaError> {
        if self.deny_display_media.load(Ordering::SeqCst) {
            return Err(MediaError::Denied("screen picker dismissed".to_string()));
        }
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen);
        lock(&self.screens).push(track.clone());
        Ok(track)
    }
}

// --- Peer engine ---------------------------------------------------------

struct FakePeerState {
    user_id: UserId,
    initiator: bool,
    sink: PeerEventSink,
    signals: Mutex<Vec<Value>>,
    video: Mutex<Option<MediaTrack>>,
    closed: AtomicBool,
    reject_signals: AtomicBool,
}

/// Test-side view of one fake connection.
#[derive(Clone)]
pub struct FakePeerHandle {
    state: Arc<FakePeerState>,
}

impl FakePeerHandle {
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.state.user_id
    }

    #[must_use]
    pub fn initiator(&self) -> bool {
        self.state.initiator
    }

    /// Remote negotiation data applied so far.
    #[must_use]
    pub fn signals_received(&self) -> Vec<Value> {
        lock(&self.state.signals).clone()
    }

    /// The outbound video track currently sent.
    #[must_use]
    pub fn video_track(&self) -> Option<MediaTrack> {
        lock(&self.state.video).clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Fail every later `signal`.
    pub fn reject_signals(&self) {
        self.state.reject_signals.store(true, Ordering::SeqCst);
    }

    /// Act as the engine and report an event.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.state.sink.emit(event)
    }
}

struct FakePeerConnection {
    state: Arc<FakePeerState>,
}

impl PeerConnection for FakePeerConnection {
    fn signal(&mut self, data: Value) -> Result<(), PeerError> {
        if self.state.reject_signals.load(Ordering::SeqCst) {
            return Err(PeerError::Signal("negotiation failed".to_string()));
        }
        lock(&self.state.signals).push(data);
        Ok(())
    }

    fn replace_video_track(&mut self, track: Option<MediaTrack>) -> Result<(), PeerError> {
        *lock(&self.state.video) = track;
        Ok(())
    }

    fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Peer engine that records every connection it creates.
#[derive(Default)]
pub struct FakePeerFactory {
    connections: Mutex<Vec<FakePeerHandle>>,
    fail_next: AtomicBool,
    created: AtomicUsize,
}

impl FakePeerFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `create` fails.
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every connection created, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<FakePeerHandle> {
        lock(&self.connections).clone()
    }

    /// The most recent connection to `user_id`.
    #[must_use]
    pub fn connection_for(&self, user_id: &UserId) -> Option<FakePeerHandle> {
        lock(&self.connections)
            .iter()
            .rev()
            .find(|c| c.user_id() == user_id)
            .cloned()
    }

    /// Connections to `user_id` that are still open.
    #[must_use]
    pub fn live_count(&self, user_id: &UserId) -> usize {
        lock(&self.connections)
            .iter()
            .filter(|c| c.user_id() == user_id && !c.is_closed())
            .count()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl PeerConnectionFactory for FakePeerFactory {
    fn create(
        &self,
        config: PeerConfig,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PeerError::Create("engine refused".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);

        let state = Arc::new(FakePeerState {
            user_id: config.remote,
            initiator: config.initiator,
            sink: events,
            signals: Mutex::new(Vec::new()),
            video: Mutex::new(config.outbound_video),
            closed: AtomicBool::new(false),
            reject_signals: AtomicBool::new(false),
        });
        lock(&self.connections).push(FakePeerHandle {
            state: Arc::clone(&state),
        });
        Ok(Box::new(FakePeerConnection { state }))
    }
}

// --- Call API ------------------------------------------------------------

/// A request the mock API received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    Start(StartCallRequest),
    Join(CallId),
    Leave(CallId),
}

/// In-memory `CallApi`.
pub struct MockCallApi {
    user_id: UserId,
    requests: Mutex<Vec<ApiRequest>>,
    join_response: Mutex<Option<JoinedCall>>,
    start_error: Mutex<Option<CallError>>,
    join_error: Mutex<Option<CallError>>,
    leave_error: Mutex<Option<CallError>>,
}

impl MockCallApi {
    /// Mock acting for `user_id` (the initiator of calls it starts).
    #[must_use]
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            requests: Mutex::new(Vec::new()),
            join_response: Mutex::new(None),
            start_error: Mutex::new(None),
            join_error: Mutex::new(None),
            leave_error: Mutex::new(None),
        }
    }

    /// What `join_call` returns. Without one, the join returns a call with
    /// the requested id and only the local user on the roster.
    pub fn set_join_response(&self, joined: JoinedCall) {
        *lock(&self.join_response) = Some(joined);
    }

    pub fn fail_start(&self, error: CallError) {
        *lock(&self.start_error) = Some(error);
    }

    pub fn fail_join(&self, error: CallError) {
        *lock(&self.join_error) = Some(error);
    }

    pub fn fail_leave(&self, error: CallError) {
        *lock(&self.leave_error) = Some(error);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }

    /// Calls left through the API, in order.
    #[must_use]
    pub fn left_calls(&self) -> Vec<CallId> {
        lock(&self.requests)
            .iter()
            .filter_map(|r| match r {
                ApiRequest::Leave(call_id) => Some(*call_id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CallApi for MockCallApi {
    async fn start_call(&self, request: &StartCallRequest) -> Result<Call, CallError> {
        lock(&self.requests).push(ApiRequest::Start(request.clone()));
        if let Some(error) = lock(&self.start_error).clone() {
            return Err(error);
        }
        Ok(Call {
            id: CallId::new(),
            channel_id: request.channel_id.clone(),
            workspace_id: request.workspace_id.clone(),
            call_type: request.call_type,
            initiator: self.user_id.clone(),
            created_at: Utc::now(),
        })
    }

    async fn join_call(&self, call_id: CallId) -> Result<JoinedCall, CallError> {
        lock(&self.requests).push(ApiRequest::Join(call_id));
        if let Some(error) = lock(&self.join_error).clone() {
            return Err(error);
        }
        if let Some(joined) = lock(&self.join_response).clone() {
            return Ok(joined);
        }

        let mut call = test_call(self.user_id.as_str(), CallType::Voice);
        call.id = call_id;
        Ok(JoinedCall {
            call,
            participants: vec![CallParticipant::joined_now(self.user_id.clone())],
        })
    }

    async fn leave_call(&self, call_id: CallId) -> Result<(), CallError> {
        lock(&self.requests).push(ApiRequest::Leave(call_id));
        match lock(&self.leave_error).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// --- Signaling -----------------------------------------------------------

/// `SignalingChannel` that records outbound events and lets tests inject
/// inbound ones.
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<ClientEvent>>,
    registered: Mutex<Vec<UserId>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl RecordingSignaling {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbound events so far, excluding `register`.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientEvent> {
        lock(&self.sent).clone()
    }

    /// Drain the outbound log.
    pub fn take_sent(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *lock(&self.sent))
    }

    /// Distinct users registered, in order.
    #[must_use]
    pub fn registered(&self) -> Vec<UserId> {
        lock(&self.registered).clone()
    }

    /// Deliver an inbound event to the subscriber.
    pub fn inject(&self, event: ServerEvent) {
        self.deliver(ChannelEvent::Message(event));
    }

    pub fn disconnect(&self) {
        self.deliver(ChannelEvent::Disconnected);
    }

    pub fn reconnect(&self) {
        self.deliver(ChannelEvent::Reconnected);
    }

    fn deliver(&self, event: ChannelEvent) {
        if let Some(tx) = lock(&self.subscriber).as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl SignalingChannel for RecordingSignaling {
    fn register(&self, user_id: UserId) {
        let mut registered = lock(&self.registered);
        if !registered.contains(&user_id) {
            registered.push(user_id);
        }
    }

    fn send(&self, event: ClientEvent) {
        lock(&self.sent).push(event);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.subscriber) = Some(tx);
        rx
    }
}
