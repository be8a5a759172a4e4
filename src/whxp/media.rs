//! Track collections and presentation sinks

use super::engine::{Direction, MediaKind, MediaTrack, TransceiverId};
use super::WhxpError;
use std::fmt;
use std::sync::Arc;

/// Ordered set of tracks; insertion order is arrival order
#[derive(Clone, Default)]
pub struct MediaCollection {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(track: Arc<dyn MediaTrack>) -> Self {
        Self { tracks: vec![track] }
    }

    /// Append `track` unless a track with the same id is already present
    pub fn add(&mut self, track: Arc<dyn MediaTrack>) -> bool {
        if self.contains(track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_string()).collect()
    }

    pub fn kinds(&self) -> Vec<Option<MediaKind>> {
        self.tracks.iter().map(|t| t.kind()).collect()
    }

    /// Tracks of one kind, in arrival order
    pub fn of_kind(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> + '_ {
        self.tracks.iter().filter(move |t| t.kind() == Some(kind))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl fmt::Debug for MediaCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tracks.iter().map(|t| t.id())).finish()
    }
}

/// Transceiver wired to the session's presentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackBinding {
    pub kind: MediaKind,
    pub direction: Direction,
    pub transceiver: TransceiverId,
    /// Local track id for send-only bindings
    pub track_id: Option<String>,
}

/// Consumer that renders a track collection
pub trait VideoSink: Send + Sync {
    /// Replace the attached collection
    fn attach(&mut self, collection: MediaCollection) -> Result<(), WhxpError>;

    fn detach(&mut self) -> Result<(), WhxpError>;
}

/// Running audio level visualization
pub trait Visualizer: Send + Sync {
    fn start(&mut self) -> Result<(), WhxpError>;

    fn stop(&mut self) -> Result<(), WhxpError>;
}

/// Audio metering sink; wraps collections into visualizers
pub trait LevelMeter: Send + Sync {
    fn visualizer(&mut self, collection: MediaCollection) -> Box<dyn Visualizer>;
}

/// Sinks handed to a session at construction
pub struct PresentationSinks {
    pub video: Box<dyn VideoSink>,
    pub meter: Box<dyn LevelMeter>,
}

impl PresentationSinks {
    pub fn new(video: Box<dyn VideoSink>, meter: Box<dyn LevelMeter>) -> Self {
        Self { video, meter }
    }
}
