//! WHIP/WHEP session client
//!
//! Manages the lifecycle of one publish or subscribe session:
//! - Peer connection setup and transceiver declaration
//! - Local capture wiring (publish) and inbound track assembly (subscribe)
//! - Negotiation on renegotiation-needed events
//! - Ordered, best-effort teardown
//!
//! Each session runs on its own task. Engine events, caller commands and
//! the in-flight negotiation are multiplexed by one `select!` loop, so no
//! handler ever runs concurrently with another.

use super::codec::CodecPreferences;
use super::engine::{
    CaptureRequest, CaptureSource, ConnectionState, Direction, EngineEvent, MediaEngine, MediaKind, MediaTrack,
    PeerConnection, TransceiverId,
};
use super::media::{PresentationSinks, TrackBinding, Visualizer};
use super::negotiator::{NegotiationOutcome, Negotiator, DEFAULT_BACKOFF};
use super::signaling::{resolve_location, SignalingTransport};
use super::state::{Effect, SessionState};
use super::WhxpError;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

pub use super::state::{SessionMode, SessionStatus};

/// Per-session settings supplied by the caller
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// WHIP or WHEP endpoint URL
    pub endpoint: String,
    /// Bearer token, may be empty
    pub token: String,
    pub codecs: CodecPreferences,
    /// Pause between failed negotiation attempts
    pub backoff: Duration,
    pub capture: CaptureRequest,
}

impl SessionOptions {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            codecs: CodecPreferences::default(),
            backoff: DEFAULT_BACKOFF,
            capture: CaptureRequest::default(),
        }
    }
}

/// Teardown steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    DetachSink,
    StopVisualizer,
    DeleteSession,
    CloseConnection,
    StopLocalTracks,
}

/// What a teardown attempted and what failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub attempted: Vec<TeardownStep>,
    pub errors: Vec<WhxpError>,
}

impl TeardownReport {
    fn record(&mut self, step: TeardownStep, result: Result<(), WhxpError>) {
        if !self.attempted.contains(&step) {
            self.attempted.push(step);
        }
        if let Err(e) = result {
            warn!("Teardown step {:?} failed: {}", step, e);
            self.errors.push(e);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

enum Command {
    Stop(oneshot::Sender<TeardownReport>),
}

/// Owner's handle to a running session
pub struct SessionHandle {
    id: String,
    mode: SessionMode,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the session has been torn down
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.closed).await;
    }

    /// Tear the session down: detach the sink, stop the visualizer, delete
    /// the remote resource, close the connection, stop local tracks.
    pub async fn disconnect_stream(&self) -> Result<TeardownReport, WhxpError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(reply_tx))
            .await
            .map_err(|_| WhxpError::SessionClosed)?;
        reply_rx.await.map_err(|_| WhxpError::SessionClosed)
    }
}

/// Session client shared by the publish and subscribe variants
pub struct SessionClient {
    state: SessionState,
    options: SessionOptions,
    connection: Arc<dyn PeerConnection>,
    signaling: Arc<dyn SignalingTransport>,
    negotiator: Negotiator,
    /// Raised once the in-flight cycle has committed its offer
    offer_committed: Arc<AtomicBool>,
    sinks: PresentationSinks,
    visualizer: Option<Box<dyn Visualizer>>,
    local_tracks: Option<Vec<Arc<dyn MediaTrack>>>,
    connection_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<SessionStatus>,
}

type Negotiation = Option<BoxFuture<'static, NegotiationOutcome>>;

impl SessionClient {
    /// Start a WHIP session publishing what `capture` provides
    pub async fn publish(
        engine: &dyn MediaEngine,
        signaling: Arc<dyn SignalingTransport>,
        capture: Arc<dyn CaptureSource>,
        sinks: PresentationSinks,
        options: SessionOptions,
    ) -> Result<SessionHandle, WhxpError> {
        Self::start(SessionMode::Publish, engine, signaling, Some(capture), sinks, options).await
    }

    /// Start a WHEP session playing the remote stream into `sinks`
    pub async fn subscribe(
        engine: &dyn MediaEngine,
        signaling: Arc<dyn SignalingTransport>,
        sinks: PresentationSinks,
        options: SessionOptions,
    ) -> Result<SessionHandle, WhxpError> {
        Self::start(SessionMode::Subscribe, engine, signaling, None, sinks, options).await
    }

    async fn start(
        mode: SessionMode,
        engine: &dyn MediaEngine,
        signaling: Arc<dyn SignalingTransport>,
        capture: Option<Arc<dyn CaptureSource>>,
        sinks: PresentationSinks,
        options: SessionOptions,
    ) -> Result<SessionHandle, WhxpError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = engine.create_peer_connection(events_tx).await?;

        let id = uuid::Uuid::new_v4().to_string();
        info!("Session {} {} peer connection created for {}", id, mode.as_str(), options.endpoint);

        let state = SessionState::new(id.clone(), mode);
        let (connection_tx, _) = watch::channel(ConnectionState::New);
        let (status_tx, status_rx) = watch::channel(state.status());
        let negotiator = Negotiator::new(signaling.clone(), options.backoff);

        let mut client = Self {
            state,
            options,
            connection,
            signaling,
            negotiator,
            offer_committed: Arc::new(AtomicBool::new(false)),
            sinks,
            visualizer: None,
            local_tracks: None,
            connection_tx,
            status_tx,
        };

        if mode == SessionMode::Subscribe {
            if let Err(e) = client.declare_receivers().await {
                let _ = client.connection.close().await;
                return Err(e);
            }
        }

        let (commands_tx, commands_rx) = mpsc::channel(4);
        tokio::spawn(client.run(events_rx, commands_rx, capture));

        Ok(SessionHandle {
            id,
            mode,
            commands: commands_tx,
            status: status_rx,
        })
    }

    /// One receive-only transceiver per kind, audio first
    async fn declare_receivers(&mut self) -> Result<(), WhxpError> {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let transceiver = self.connection.add_transceiver(kind, Direction::RecvOnly).await?;
            self.apply_codec_preference(kind, transceiver).await;
            self.state.record_binding(TrackBinding {
                kind,
                direction: Direction::RecvOnly,
                transceiver,
                track_id: None,
            });
        }
        Ok(())
    }

    /// Reorder the engine's codecs for `kind` on this transceiver only
    async fn apply_codec_preference(&self, kind: MediaKind, transceiver: TransceiverId) {
        let Some(preference) = self.options.codecs.for_kind(kind) else {
            return;
        };
        let mut codecs = self.connection.codec_capabilities(kind);
        if !preference.apply(&mut codecs) {
            warn!("Session {} engine does not offer {} codec {}", self.state.id(), kind, preference);
            return;
        }
        match self.connection.set_codec_preferences(transceiver, &codecs).await {
            Ok(()) => debug!("Session {} prefers {} for {}", self.state.id(), preference, kind),
            Err(e) => warn!("Session {} could not set {} codec preference: {}", self.state.id(), kind, e),
        }
    }

    /// Attach captured tracks as send-only transceivers and present them
    async fn acquire_local_media(&mut self, capture: &dyn CaptureSource) {
        let tracks = match capture.acquire(&self.options.capture).await {
            Ok(tracks) => tracks,
            Err(e) => {
                let err = match e {
                    WhxpError::CaptureAcquisition(_) => e,
                    other => WhxpError::CaptureAcquisition(other.to_string()),
                };
                self.state.surface(err);
                return;
            }
        };

        let mut held = Vec::with_capacity(tracks.len());
        for track in tracks {
            let Some(kind) = track.kind() else {
                debug!("Session {} skipping capture track {} of unknown kind", self.state.id(), track.id());
                let _ = track.stop();
                continue;
            };
            let transceiver = match self.connection.add_track(track.clone(), Direction::SendOnly).await {
                Ok(transceiver) => transceiver,
                Err(e) => {
                    warn!("Session {} could not send {} track {}: {}", self.state.id(), kind, track.id(), e);
                    let _ = track.stop();
                    continue;
                }
            };
            self.apply_codec_preference(kind, transceiver).await;
            self.state.record_binding(TrackBinding {
                kind,
                direction: Direction::SendOnly,
                transceiver,
                track_id: Some(track.id().to_string()),
            });
            for effect in self.state.on_local_track(track.clone()) {
                self.present(effect);
            }
            held.push(track);
        }
        info!("Session {} publishing {} local track(s)", self.state.id(), held.len());
        self.local_tracks = Some(held);
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        mut commands: mpsc::Receiver<Command>,
        capture: Option<Arc<dyn CaptureSource>>,
    ) {
        if let Some(capture) = capture {
            self.acquire_local_media(capture.as_ref()).await;
            self.publish_status();
        }

        let mut negotiation: Negotiation = None;
        loop {
            // Queued engine events are handled before the negotiation is
            // polled again, so requests that predate its offer are seen as
            // covered by it.
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let report = self.teardown(negotiation.take()).await;
                    self.publish_status();
                    match command {
                        Some(Command::Stop(reply)) => {
                            let _ = reply.send(report);
                        }
                        None => debug!("Session {} handle dropped", self.state.id()),
                    }
                    break;
                }
                Some(event) = events.recv() => {
                    if let EngineEvent::ConnectionStateChanged(state) = &event {
                        self.connection_tx.send_replace(*state);
                    }
                    if self.offer_committed.load(Ordering::SeqCst) {
                        self.state.on_offer_committed();
                    }
                    let effects = self.state.on_engine_event(event);
                    if self.apply(effects, &mut negotiation).await {
                        break;
                    }
                }
                outcome = async {
                    match negotiation.as_mut() {
                        Some(pending) => pending.await,
                        None => std::future::pending().await,
                    }
                }, if negotiation.is_some() => {
                    negotiation = None;
                    let effects = self.state.on_negotiation_finished(outcome);
                    if self.apply(effects, &mut negotiation).await {
                        break;
                    }
                }
            }
            self.publish_status();
        }
        self.publish_status();
        info!("Session {} finished", self.state.id());
    }

    /// Run effects; returns `true` once the session has been torn down
    async fn apply(&mut self, effects: Vec<Effect>, negotiation: &mut Negotiation) -> bool {
        for effect in effects {
            match effect {
                Effect::Negotiate => *negotiation = Some(self.start_negotiation()),
                Effect::Release(location) => {
                    if let Err(e) = self.delete_session(&location).await {
                        warn!("Session {} failed to release {}: {}", self.state.id(), location, e);
                    }
                }
                Effect::Teardown => {
                    let report = self.teardown(negotiation.take()).await;
                    debug!("Session {} closed after failure: {:?}", self.state.id(), report);
                    return true;
                }
                other => self.present(other),
            }
        }
        false
    }

    fn present(&mut self, effect: Effect) {
        match effect {
            Effect::AttachSink(collection) => {
                debug!("Session {} attaching {:?}", self.state.id(), collection);
                if let Err(e) = self.sinks.video.attach(collection) {
                    warn!("Session {} sink attach failed: {}", self.state.id(), e);
                }
            }
            Effect::StartVisualizer(collection) => {
                if let Some(mut running) = self.visualizer.take() {
                    if let Err(e) = running.stop() {
                        warn!("Session {} could not stop previous visualizer: {}", self.state.id(), e);
                    }
                }
                let mut visualizer = self.sinks.meter.visualizer(collection);
                match visualizer.start() {
                    Ok(()) => self.visualizer = Some(visualizer),
                    Err(e) => warn!("Session {} visualizer failed to start: {}", self.state.id(), e),
                }
            }
            Effect::Negotiate | Effect::Release(_) | Effect::Teardown => {}
        }
    }

    fn start_negotiation(&mut self) -> BoxFuture<'static, NegotiationOutcome> {
        self.offer_committed = Arc::new(AtomicBool::new(false));
        let negotiator = self.negotiator.clone().with_offer_flag(self.offer_committed.clone());
        let connection = self.connection.clone();
        let state = self.connection_tx.subscribe();
        let endpoint = self.options.endpoint.clone();
        let token = self.options.token.clone();
        Box::pin(async move { negotiator.negotiate(connection.as_ref(), state, &endpoint, &token).await })
    }

    /// Every step is attempted regardless of earlier failures.
    ///
    /// A negotiation still in flight is cancelled by the close; if its answer
    /// was applied anyway, the resource it created is deleted after the close.
    async fn teardown(&mut self, negotiation: Negotiation) -> TeardownReport {
        info!("Session {} disconnecting", self.state.id());
        let location = self.state.begin_teardown();
        let mut report = TeardownReport::default();

        report.record(TeardownStep::DetachSink, self.sinks.video.detach());

        let stopped = match self.visualizer.take() {
            Some(mut visualizer) => visualizer.stop(),
            None => Ok(()),
        };
        report.record(TeardownStep::StopVisualizer, stopped);

        match &location {
            Some(location) => report.record(TeardownStep::DeleteSession, self.delete_session(location).await),
            None if negotiation.is_some() => {}
            None => report.record(TeardownStep::DeleteSession, Err(no_resource())),
        }

        self.connection_tx.send_replace(ConnectionState::Closed);
        report.record(TeardownStep::CloseConnection, self.connection.close().await);

        if let Some(pending) = negotiation {
            match pending.await {
                NegotiationOutcome::Established(Some(late)) if location.as_deref() != Some(late.as_str()) => {
                    info!("Session {} answer from {} applied during teardown", self.state.id(), late);
                    report.record(TeardownStep::DeleteSession, self.delete_session(&late).await);
                }
                outcome => {
                    debug!("Session {} in-flight negotiation ended: {:?}", self.state.id(), outcome);
                    if location.is_none() {
                        report.record(TeardownStep::DeleteSession, Err(no_resource()));
                    }
                }
            }
        }

        match self.local_tracks.take() {
            Some(tracks) => {
                for track in tracks {
                    report.record(TeardownStep::StopLocalTracks, track.stop());
                }
            }
            None => report.record(TeardownStep::StopLocalTracks, Ok(())),
        }

        info!("Session {} closed ({} teardown error(s))", self.state.id(), report.errors.len());
        report
    }

    async fn delete_session(&self, location: &str) -> Result<(), WhxpError> {
        let url = resolve_location(&self.options.endpoint, location)?;
        let status = self.signaling.delete_session(&url).await?;
        info!("Session {} DELETE {} -> {}", self.state.id(), url, status);
        Ok(())
    }

    fn publish_status(&self) {
        let status = self.state.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

fn no_resource() -> WhxpError {
    WhxpError::Teardown("no session resource to delete".to_string())
}
