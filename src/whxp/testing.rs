//! In-crate fakes for the engine, signaling transport and sinks

use super::engine::{
    CaptureRequest, CaptureSource, CodecCapability, ConnectionState, Direction, EngineEvent, EventSender,
    MediaEngine, MediaKind, MediaTrack, PeerConnection, TransceiverId,
};
use super::media::{LevelMeter, MediaCollection, VideoSink, Visualizer};
use super::signaling::{SignalingResponse, SignalingTransport};
use super::WhxpError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Ordered record of side effects across fakes
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }
}

/// Let spawned session tasks drain their queues
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: Option<MediaKind>,
    stopped: AtomicBool,
    journal: Option<Journal>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: Option<MediaKind>, journal: Option<Journal>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            stopped: AtomicBool::new(false),
            journal,
        })
    }

    pub fn audio(id: &str) -> Arc<dyn MediaTrack> {
        Self::new(id, Some(MediaKind::Audio), None)
    }

    pub fn video(id: &str) -> Arc<dyn MediaTrack> {
        Self::new(id, Some(MediaKind::Video), None)
    }

    pub fn unknown(id: &str) -> Arc<dyn MediaTrack> {
        Self::new(id, None, None)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.lock().iter()).finish()
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> Option<MediaKind> {
        self.kind
    }

    fn stop(&self) -> Result<(), WhxpError> {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.push(format!("stop:{}", self.id));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeTransceiver {
    pub kind: MediaKind,
    pub direction: Direction,
    pub track_id: Option<String>,
}

/// Peer connection that records every call
#[derive(Default)]
pub struct FakePeer {
    offers: AtomicUsize,
    remote: Mutex<Vec<String>>,
    transceivers: Mutex<Vec<FakeTransceiver>>,
    preferences: Mutex<Vec<(TransceiverId, Vec<CodecCapability>)>>,
    state: Mutex<ConnectionState>,
    events: Mutex<Option<EventSender>>,
    fail_offer: AtomicBool,
    fail_remote: AtomicBool,
    hold_remote: AtomicBool,
    remote_gate: Notify,
    journal: Journal,
}

impl FakePeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn fail_offer(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    pub fn fail_remote_description(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    /// Park `set_remote_description` until [`FakePeer::release_remote_description`] or close
    pub fn hold_remote_description(&self) {
        self.hold_remote.store(true, Ordering::SeqCst);
    }

    pub fn release_remote_description(&self) {
        self.hold_remote.store(false, Ordering::SeqCst);
        self.remote_gate.notify_waiters();
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn remote_descriptions(&self) -> Vec<String> {
        self.remote.lock().clone()
    }

    pub fn transceivers(&self) -> Vec<FakeTransceiver> {
        self.transceivers.lock().clone()
    }

    pub fn preferences(&self) -> Vec<(TransceiverId, Vec<CodecCapability>)> {
        self.preferences.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == ConnectionState::Closed
    }

    /// Deliver an engine event to the session
    pub fn emit(&self, event: EngineEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn push_transceiver(&self, transceiver: FakeTransceiver) -> TransceiverId {
        let mut transceivers = self.transceivers.lock();
        transceivers.push(transceiver);
        let id = TransceiverId(transceivers.len() - 1);
        drop(transceivers);
        self.emit(EngineEvent::NegotiationNeeded);
        id
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<String, WhxpError> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(WhxpError::Sdp("offer refused".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("v=0 offer {} m={}", n, self.transceivers.lock().len()))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String, WhxpError> {
        Ok(sdp.to_string())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), WhxpError> {
        loop {
            let opened = self.remote_gate.notified();
            if !self.hold_remote.load(Ordering::SeqCst) || self.is_closed() {
                break;
            }
            opened.await;
        }
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(WhxpError::Sdp(format!("cannot apply {}", sdp)));
        }
        self.remote.lock().push(sdp.to_string());
        Ok(())
    }

    async fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> Result<TransceiverId, WhxpError> {
        Ok(self.push_transceiver(FakeTransceiver {
            kind,
            direction,
            track_id: None,
        }))
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>, direction: Direction) -> Result<TransceiverId, WhxpError> {
        let kind = track
            .kind()
            .ok_or_else(|| WhxpError::Engine(format!("track {} has no kind", track.id())))?;
        Ok(self.push_transceiver(FakeTransceiver {
            kind,
            direction,
            track_id: Some(track.id().to_string()),
        }))
    }

    fn codec_capabilities(&self, kind: MediaKind) -> Vec<CodecCapability> {
        match kind {
            MediaKind::Audio => vec![
                CodecCapability::new("audio/opus", 48000, 2, "minptime=10;useinbandfec=1"),
                CodecCapability::new("audio/PCMU", 8000, 1, ""),
            ],
            MediaKind::Video => vec![
                CodecCapability::new("video/VP8", 90000, 0, ""),
                CodecCapability::new("video/H264", 90000, 0, "packetization-mode=1"),
            ],
        }
    }

    async fn set_codec_preferences(&self, transceiver: TransceiverId, codecs: &[CodecCapability]) -> Result<(), WhxpError> {
        self.preferences.lock().push((transceiver, codecs.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<(), WhxpError> {
        *self.state.lock() = ConnectionState::Closed;
        self.journal.push("close");
        self.remote_gate.notify_waiters();
        Ok(())
    }
}

/// Engine handing out one shared [`FakePeer`]
pub struct FakeEngine {
    pub peer: Arc<FakePeer>,
}

impl FakeEngine {
    pub fn new(peer: Arc<FakePeer>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_peer_connection(&self, events: EventSender) -> Result<Arc<dyn PeerConnection>, WhxpError> {
        *self.peer.events.lock() = Some(events);
        Ok(self.peer.clone())
    }
}

#[derive(Clone)]
pub enum Scripted {
    Response(SignalingResponse),
    TransportError,
}

/// Signaling transport replaying canned responses
pub struct ScriptedSignaling {
    script: Mutex<VecDeque<Scripted>>,
    repeat: Option<Scripted>,
    posts: Mutex<Vec<(String, String, Instant)>>,
    deletes: Mutex<Vec<String>>,
    fail_delete: AtomicBool,
    journal: Journal,
}

impl ScriptedSignaling {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            posts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            fail_delete: AtomicBool::new(false),
            journal: Journal::default(),
        }
    }

    pub fn repeating(response: Scripted) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn status(status: u16, body: &str) -> Scripted {
        Scripted::Response(SignalingResponse {
            status,
            body: body.to_string(),
            location: None,
        })
    }

    pub fn created(answer: &str, location: Option<&str>) -> Scripted {
        Scripted::Response(SignalingResponse {
            status: 201,
            body: answer.to_string(),
            location: location.map(str::to_string),
        })
    }

    pub fn transport_error() -> Scripted {
        Scripted::TransportError
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn post_times(&self) -> Vec<Instant> {
        self.posts.lock().iter().map(|(_, _, at)| *at).collect()
    }

    pub fn posted_offers(&self) -> Vec<String> {
        self.posts.lock().iter().map(|(_, sdp, _)| sdp.clone()).collect()
    }

    pub fn posted_tokens(&self) -> Vec<String> {
        self.posts.lock().iter().map(|(token, _, _)| token.clone()).collect()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.lock().len()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deletes.lock().clone()
    }
}

#[async_trait]
impl SignalingTransport for ScriptedSignaling {
    async fn post_offer(&self, _endpoint: &str, token: &str, sdp: &str) -> Result<SignalingResponse, WhxpError> {
        self.posts.lock().push((token.to_string(), sdp.to_string(), Instant::now()));
        let next = self.script.lock().pop_front().or_else(|| self.repeat.clone());
        match next {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::TransportError) | None => {
                Err(WhxpError::TransientSignaling("connection refused".to_string()))
            }
        }
    }

    async fn delete_session(&self, resource_location: &str) -> Result<u16, WhxpError> {
        self.deletes.lock().push(resource_location.to_string());
        self.journal.push(format!("delete:{}", resource_location));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(WhxpError::Teardown("DELETE refused".to_string()));
        }
        Ok(200)
    }
}

/// Video sink remembering the last attached collection
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub attached: Arc<Mutex<Option<Vec<String>>>>,
    pub attach_count: Arc<AtomicUsize>,
    pub fail_detach: Arc<AtomicBool>,
    pub journal: Journal,
}

impl RecordingSink {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn attached_ids(&self) -> Option<Vec<String>> {
        self.attached.lock().clone()
    }
}

impl VideoSink for RecordingSink {
    fn attach(&mut self, collection: MediaCollection) -> Result<(), WhxpError> {
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        *self.attached.lock() = Some(collection.ids());
        Ok(())
    }

    fn detach(&mut self) -> Result<(), WhxpError> {
        *self.attached.lock() = None;
        self.journal.push("detach");
        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(WhxpError::Sink("detach refused".to_string()));
        }
        Ok(())
    }
}

/// Level meter whose visualizers log start/stop
#[derive(Clone, Default)]
pub struct RecordingMeter {
    pub started: Arc<Mutex<Vec<Vec<String>>>>,
    pub running: Arc<AtomicUsize>,
    pub fail_stop: Arc<AtomicBool>,
    pub journal: Journal,
}

impl RecordingMeter {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }
}

struct RecordingVisualizer {
    ids: Vec<String>,
    meter: RecordingMeter,
}

impl Visualizer for RecordingVisualizer {
    fn start(&mut self) -> Result<(), WhxpError> {
        self.meter.started.lock().push(self.ids.clone());
        self.meter.running.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WhxpError> {
        self.meter.running.fetch_sub(1, Ordering::SeqCst);
        self.meter.journal.push("visualizer:stop");
        if self.meter.fail_stop.load(Ordering::SeqCst) {
            return Err(WhxpError::Sink("visualizer stuck".to_string()));
        }
        Ok(())
    }
}

impl LevelMeter for RecordingMeter {
    fn visualizer(&mut self, collection: MediaCollection) -> Box<dyn Visualizer> {
        Box::new(RecordingVisualizer {
            ids: collection.ids(),
            meter: self.clone(),
        })
    }
}

/// Capture source returning fixed tracks, or an error
pub struct FakeCapture {
    pub tracks: Vec<Arc<FakeTrack>>,
    pub fail: bool,
    pub requests: Mutex<Vec<CaptureRequest>>,
}

impl FakeCapture {
    pub fn new(tracks: Vec<Arc<FakeTrack>>) -> Self {
        Self {
            tracks,
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl CaptureSource for FakeCapture {
    async fn acquire(&self, request: &CaptureRequest) -> Result<Vec<Arc<dyn MediaTrack>>, WhxpError> {
        self.requests.lock().push(*request);
        if self.fail {
            return Err(WhxpError::CaptureAcquisition("permission denied".to_string()));
        }
        Ok(self.tracks.iter().map(|t| t.clone() as Arc<dyn MediaTrack>).collect())
    }
}
