//! Media engine capability surface
//!
//! The session client never talks to a concrete WebRTC stack directly. It
//! drives a [`PeerConnection`] and consumes [`EngineEvent`]s delivered on
//! a channel, so any engine (webrtc-rs, a test fake) can sit underneath.

use super::WhxpError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Media kind of a track or transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
}

/// Connectivity state mirrored from the engine's peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    /// Transient, no action required
    Disconnected,
    /// Terminal, the caller should tear the session down
    Failed,
    /// Terminal, set by an explicit stop
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the engine's negotiable codec list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
}

impl CodecCapability {
    pub fn new(mime_type: &str, clock_rate: u32, channels: u16, sdp_fmtp_line: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            sdp_fmtp_line: sdp_fmtp_line.to_string(),
        }
    }
}

/// Handle to a transceiver owned by a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransceiverId(pub usize);

/// Packet counters exposed by tracks that can report them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackStats {
    pub packets: u64,
    pub bytes: u64,
}

/// A local or remote media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// `None` for kinds the session does not handle
    fn kind(&self) -> Option<MediaKind>;

    fn stats(&self) -> TrackStats {
        TrackStats::default()
    }

    /// Stop producing media. Only meaningful for local capture tracks.
    fn stop(&self) -> Result<(), WhxpError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Notifications delivered by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The local description must be (re)computed
    NegotiationNeeded,
    ConnectionStateChanged(ConnectionState),
    /// Inbound track delivered by the remote side
    Track(Arc<dyn MediaTrack>),
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Peer connection operations consumed by the negotiator and session client
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce a local offer
    async fn create_offer(&self) -> Result<String, WhxpError>;

    /// Commit `sdp` as the local description and return the text to send,
    /// which may carry gathered candidates
    async fn set_local_description(&self, sdp: &str) -> Result<String, WhxpError>;

    /// Apply a remote answer
    async fn set_remote_description(&self, sdp: &str) -> Result<(), WhxpError>;

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: Direction,
    ) -> Result<TransceiverId, WhxpError>;

    /// Attach a local track on a new transceiver
    async fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        direction: Direction,
    ) -> Result<TransceiverId, WhxpError>;

    /// Codecs the engine can negotiate for `kind`, in the engine's order
    fn codec_capabilities(&self, kind: MediaKind) -> Vec<CodecCapability>;

    async fn set_codec_preferences(
        &self,
        transceiver: TransceiverId,
        codecs: &[CodecCapability],
    ) -> Result<(), WhxpError>;

    async fn close(&self) -> Result<(), WhxpError>;
}

/// Factory for peer connections
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a peer connection that reports its events on `events`
    async fn create_peer_connection(
        &self,
        events: EventSender,
    ) -> Result<Arc<dyn PeerConnection>, WhxpError>;
}

/// What the publish client asks the capture source for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: bool,
    /// Preferred video size; sources that cannot scale may ignore it
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
        }
    }
}

/// Local capture devices
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn acquire(&self, request: &CaptureRequest) -> Result<Vec<Arc<dyn MediaTrack>>, WhxpError>;
}
