//! Session event handling
//!
//! Every engine notification, capture result and negotiation outcome is
//! folded into [`SessionState`] by a plain method that returns the side
//! effects to run. Nothing here touches sinks, the network or the engine,
//! which keeps ordering decisions testable without a runtime.

use super::engine::{ConnectionState, EngineEvent, MediaKind, MediaTrack};
use super::media::{MediaCollection, TrackBinding};
use super::negotiator::NegotiationOutcome;
use super::WhxpError;
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Which protocol a session speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// WHIP: send local capture
    Publish,
    /// WHEP: receive remote media
    Subscribe,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Publish => "whip",
            SessionMode::Subscribe => "whep",
        }
    }
}

/// Side effect requested by a state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Replace the visual sink's collection
    AttachSink(MediaCollection),
    /// Start a level visualizer on the collection, replacing a running one
    StartVisualizer(MediaCollection),
    /// Begin a negotiation cycle
    Negotiate,
    /// Best-effort DELETE of a resource whose answer has been replaced
    Release(String),
    /// Fatal failure, tear the session down
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationPhase {
    Idle,
    /// Cycle started, local offer not committed yet
    Offering,
    InFlight,
    /// In flight, with another cycle requested
    Pending,
}

/// Snapshot published to the session's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub resource_location: Option<String>,
    /// Transceivers declared on the connection
    pub bindings: Vec<TrackBinding>,
    /// Last surfaced failure (configuration, capture)
    pub failure: Option<WhxpError>,
    pub closed: bool,
}

/// Session bookkeeping driven by events
pub struct SessionState {
    id: String,
    mode: SessionMode,
    connection_state: ConnectionState,
    collection: MediaCollection,
    bindings: Vec<TrackBinding>,
    sink_attached: bool,
    negotiation: NegotiationPhase,
    resource_location: Option<String>,
    failure: Option<WhxpError>,
    closed: bool,
}

impl SessionState {
    pub fn new(id: String, mode: SessionMode) -> Self {
        Self {
            id,
            mode,
            connection_state: ConnectionState::New,
            collection: MediaCollection::new(),
            bindings: Vec::new(),
            sink_attached: false,
            negotiation: NegotiationPhase::Idle,
            resource_location: None,
            failure: None,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn collection(&self) -> &MediaCollection {
        &self.collection
    }

    pub fn resource_location(&self) -> Option<&str> {
        self.resource_location.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_negotiating(&self) -> bool {
        self.negotiation != NegotiationPhase::Idle
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connection_state: self.connection_state,
            resource_location: self.resource_location.clone(),
            bindings: self.bindings.clone(),
            failure: self.failure.clone(),
            closed: self.closed,
        }
    }

    pub fn record_binding(&mut self, binding: TrackBinding) {
        self.bindings.push(binding);
    }

    /// Record a failure that the owner should see without closing the session
    pub fn surface(&mut self, err: WhxpError) {
        error!("Session {}: {}", self.id, err);
        self.failure = Some(err);
    }

    pub fn on_engine_event(&mut self, event: EngineEvent) -> Vec<Effect> {
        if self.closed {
            debug!("Session {} ignoring {:?} after close", self.id, event);
            return Vec::new();
        }
        match event {
            EngineEvent::NegotiationNeeded => self.on_negotiation_needed(),
            EngineEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            EngineEvent::Track(track) => self.on_remote_track(track),
        }
    }

    fn on_negotiation_needed(&mut self) -> Vec<Effect> {
        match self.negotiation {
            NegotiationPhase::Idle => {
                info!("Session {} connection negotiation starting", self.id);
                self.negotiation = NegotiationPhase::Offering;
                vec![Effect::Negotiate]
            }
            NegotiationPhase::Offering => {
                debug!("Session {} offer not created yet, request already covered", self.id);
                Vec::new()
            }
            NegotiationPhase::InFlight => {
                debug!("Session {} negotiation already running, queueing another cycle", self.id);
                self.negotiation = NegotiationPhase::Pending;
                Vec::new()
            }
            NegotiationPhase::Pending => Vec::new(),
        }
    }

    /// The in-flight cycle committed its offer; later requests need a new cycle
    pub fn on_offer_committed(&mut self) {
        if self.negotiation == NegotiationPhase::Offering {
            self.negotiation = NegotiationPhase::InFlight;
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) -> Vec<Effect> {
        if self.connection_state != state {
            info!("Session {} connection state: {} -> {}", self.id, self.connection_state, state);
        }
        self.connection_state = state;
        match state {
            ConnectionState::Connected => {
                // Engines may report connectivity before any track event.
                if self.mode == SessionMode::Subscribe && !self.sink_attached {
                    self.sink_attached = true;
                    return vec![Effect::AttachSink(self.collection.clone())];
                }
                Vec::new()
            }
            ConnectionState::Disconnected => {
                debug!("Session {} temporarily disconnected", self.id);
                Vec::new()
            }
            ConnectionState::Failed => {
                warn!("Session {} connection failed, the session should be stopped", self.id);
                Vec::new()
            }
            ConnectionState::Closed => {
                self.closed = true;
                Vec::new()
            }
            ConnectionState::New | ConnectionState::Connecting => Vec::new(),
        }
    }

    fn on_remote_track(&mut self, track: Arc<dyn MediaTrack>) -> Vec<Effect> {
        if self.mode == SessionMode::Publish {
            warn!("Session {} is send-only, ignoring inbound track {}", self.id, track.id());
            return Vec::new();
        }
        let kind = match track.kind() {
            Some(kind) => kind,
            None => {
                info!("Session {} got unknown track {}", self.id, track.id());
                return Vec::new();
            }
        };
        if !self.collection.add(track.clone()) {
            debug!("Session {} already holds track {}", self.id, track.id());
            return Vec::new();
        }
        info!("Session {} received {} track {}", self.id, kind, track.id());
        self.sink_attached = true;
        match kind {
            MediaKind::Video => vec![Effect::AttachSink(self.collection.clone())],
            MediaKind::Audio => vec![
                Effect::AttachSink(self.collection.clone()),
                Effect::StartVisualizer(self.collection.clone()),
            ],
        }
    }

    /// Wire a captured local track to presentation
    pub fn on_local_track(&mut self, track: Arc<dyn MediaTrack>) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        match track.kind() {
            Some(MediaKind::Video) => {
                self.sink_attached = true;
                vec![Effect::AttachSink(MediaCollection::single(track))]
            }
            Some(MediaKind::Audio) => vec![Effect::StartVisualizer(MediaCollection::single(track))],
            None => {
                debug!("Session {} not presenting local track {}", self.id, track.id());
                Vec::new()
            }
        }
    }

    pub fn on_negotiation_finished(&mut self, outcome: NegotiationOutcome) -> Vec<Effect> {
        let pending = self.negotiation == NegotiationPhase::Pending;
        self.negotiation = NegotiationPhase::Idle;
        info!("Session {} connection negotiation ended", self.id);

        match outcome {
            NegotiationOutcome::Established(location) => {
                let mut effects = Vec::new();
                if self.resource_location != location {
                    // The applied answer owns the live media from now on.
                    if let Some(location) = &location {
                        info!("Session {} resource at {}", self.id, location);
                    }
                    if let Some(replaced) = std::mem::replace(&mut self.resource_location, location) {
                        warn!("Session {} answer replaced resource {}, releasing it", self.id, replaced);
                        effects.push(Effect::Release(replaced));
                    }
                }
                if pending && !self.closed {
                    self.negotiation = NegotiationPhase::Offering;
                    effects.push(Effect::Negotiate);
                }
                effects
            }
            NegotiationOutcome::Rejected(err) | NegotiationOutcome::Failed(err) => {
                self.surface(err);
                if self.closed {
                    return Vec::new();
                }
                vec![Effect::Teardown]
            }
            NegotiationOutcome::Aborted => Vec::new(),
        }
    }

    /// Mark the session closed and hand out the resource location, once
    pub fn begin_teardown(&mut self) -> Option<String> {
        self.closed = true;
        self.connection_state = ConnectionState::Closed;
        self.sink_attached = false;
        self.resource_location.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whxp::testing::FakeTrack;

    fn subscribe() -> SessionState {
        SessionState::new("test".to_string(), SessionMode::Subscribe)
    }

    fn attached_ids(effects: &[Effect]) -> Option<Vec<String>> {
        effects.iter().find_map(|e| match e {
            Effect::AttachSink(c) => Some(c.ids()),
            _ => None,
        })
    }

    #[test]
    fn test_audio_then_video_collects_both_in_order() {
        let mut state = subscribe();
        let first = state.on_engine_event(EngineEvent::Track(FakeTrack::audio("a0")));
        assert!(matches!(first.as_slice(), [Effect::AttachSink(_), Effect::StartVisualizer(_)]));

        let second = state.on_engine_event(EngineEvent::Track(FakeTrack::video("v0")));
        assert_eq!(attached_ids(&second), Some(vec!["a0".to_string(), "v0".to_string()]));
        assert_eq!(state.collection().kinds(), vec![Some(MediaKind::Audio), Some(MediaKind::Video)]);
    }

    #[test]
    fn test_duplicate_track_event_is_ignored() {
        let mut state = subscribe();
        state.on_engine_event(EngineEvent::Track(FakeTrack::video("v0")));
        let effects = state.on_engine_event(EngineEvent::Track(FakeTrack::video("v0")));
        assert!(effects.is_empty());
        assert_eq!(state.collection().len(), 1);
    }

    #[test]
    fn test_unknown_track_kind_is_ignored() {
        let mut state = subscribe();
        let effects = state.on_engine_event(EngineEvent::Track(FakeTrack::unknown("x0")));
        assert!(effects.is_empty());
        assert!(state.collection().is_empty());
    }

    #[test]
    fn test_connected_attaches_when_no_track_arrived() {
        let mut state = subscribe();
        let effects = state.on_engine_event(EngineEvent::ConnectionStateChanged(ConnectionState::Connected));
        assert_eq!(attached_ids(&effects), Some(Vec::new()));
        assert_eq!(state.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_track_handler_wins_over_connected_fallback() {
        let mut state = subscribe();
        state.on_engine_event(EngineEvent::Track(FakeTrack::video("v0")));
        let effects = state.on_engine_event(EngineEvent::ConnectionStateChanged(ConnectionState::Connected));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_publish_ignores_inbound_tracks() {
        let mut state = SessionState::new("pub".to_string(), SessionMode::Publish);
        let effects = state.on_engine_event(EngineEvent::Track(FakeTrack::video("v0")));
        assert!(effects.is_empty());
        let effects = state.on_engine_event(EngineEvent::ConnectionStateChanged(ConnectionState::Connected));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_publish_local_tracks_route_by_kind() {
        let mut state = SessionState::new("pub".to_string(), SessionMode::Publish);
        let video = state.on_local_track(FakeTrack::video("cam"));
        assert_eq!(attached_ids(&video), Some(vec!["cam".to_string()]));
        let audio = state.on_local_track(FakeTrack::audio("mic"));
        assert!(matches!(audio.as_slice(), [Effect::StartVisualizer(c)] if c.ids() == vec!["mic"]));
    }

    #[test]
    fn test_requests_before_offer_are_covered() {
        let mut state = subscribe();
        assert!(matches!(state.on_engine_event(EngineEvent::NegotiationNeeded).as_slice(), [Effect::Negotiate]));
        assert!(state.on_engine_event(EngineEvent::NegotiationNeeded).is_empty());

        let effects = state.on_negotiation_finished(NegotiationOutcome::Established(Some("/s/1".to_string())));
        assert!(effects.is_empty());
        assert_eq!(state.resource_location(), Some("/s/1"));
        assert!(!state.is_negotiating());
    }

    #[test]
    fn test_requests_after_offer_are_coalesced() {
        let mut state = subscribe();
        state.on_engine_event(EngineEvent::NegotiationNeeded);
        state.on_offer_committed();
        assert!(state.on_engine_event(EngineEvent::NegotiationNeeded).is_empty());
        assert!(state.on_engine_event(EngineEvent::NegotiationNeeded).is_empty());

        let effects = state.on_negotiation_finished(NegotiationOutcome::Established(Some("/s/1".to_string())));
        assert!(matches!(effects.as_slice(), [Effect::Negotiate]));

        // The follow-up cycle has not committed an offer yet.
        assert!(state.on_engine_event(EngineEvent::NegotiationNeeded).is_empty());
        let effects = state.on_negotiation_finished(NegotiationOutcome::Established(Some("/s/1".to_string())));
        assert!(effects.is_empty());
        assert!(!state.is_negotiating());
    }

    #[test]
    fn test_replaced_resource_is_released() {
        let mut state = subscribe();
        state.on_engine_event(EngineEvent::NegotiationNeeded);
        state.on_negotiation_finished(NegotiationOutcome::Established(Some("/s/1".to_string())));

        state.on_engine_event(EngineEvent::NegotiationNeeded);
        let effects = state.on_negotiation_finished(NegotiationOutcome::Established(Some("/s/2".to_string())));

        assert!(matches!(effects.as_slice(), [Effect::Release(old)] if old == "/s/1"));
        assert_eq!(state.resource_location(), Some("/s/2"));
        assert_eq!(state.begin_teardown(), Some("/s/2".to_string()));
    }

    #[test]
    fn test_bindings_are_published() {
        let mut state = subscribe();
        let binding = TrackBinding {
            kind: MediaKind::Audio,
            direction: crate::whxp::engine::Direction::RecvOnly,
            transceiver: crate::whxp::engine::TransceiverId(0),
            track_id: None,
        };
        state.record_binding(binding.clone());
        assert_eq!(state.status().bindings, vec![binding]);
    }

    #[test]
    fn test_rejection_requests_teardown_and_surfaces_error() {
        let mut state = subscribe();
        state.on_engine_event(EngineEvent::NegotiationNeeded);
        let effects = state.on_negotiation_finished(NegotiationOutcome::Rejected(WhxpError::Configuration("405".to_string())));
        assert!(matches!(effects.as_slice(), [Effect::Teardown]));
        assert!(matches!(state.status().failure, Some(WhxpError::Configuration(_))));
        assert_eq!(state.resource_location(), None);
    }

    #[test]
    fn test_teardown_hands_out_location_once() {
        let mut state = subscribe();
        state.on_engine_event(EngineEvent::NegotiationNeeded);
        state.on_negotiation_finished(NegotiationOutcome::Established(Some("/s/1".to_string())));
        assert_eq!(state.begin_teardown(), Some("/s/1".to_string()));
        assert_eq!(state.begin_teardown(), None);
        assert!(state.is_closed());
        assert!(state.on_engine_event(EngineEvent::Track(FakeTrack::video("late"))).is_empty());
    }
}
