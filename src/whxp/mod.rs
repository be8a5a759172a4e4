//! WHIP/WHEP session client
//!
//! This module provides client-side session establishment for:
//! - WHIP publishing (send-only audio/video into a remote session)
//! - WHEP playback (receive-only audio/video from a remote session)
//! - SDP offer/answer exchange over HTTP with retry
//! - Deterministic session teardown

pub mod engine;
pub mod codec;
pub mod signaling;
pub mod negotiator;
pub mod media;
pub mod state;
pub mod session;
#[cfg(feature = "webrtc-engine")]
pub mod peer_connection;
#[cfg(feature = "webrtc-engine")]
pub mod media_track;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{CodecPreference, CodecPreferences};
pub use engine::{
    CaptureRequest, CaptureSource, ConnectionState, Direction, EngineEvent, MediaEngine, MediaKind, MediaTrack,
    PeerConnection,
};
pub use media::{LevelMeter, MediaCollection, PresentationSinks, VideoSink, Visualizer};
pub use negotiator::{NegotiationOutcome, Negotiator};
pub use session::{SessionClient, SessionHandle, SessionMode, SessionOptions, SessionStatus, TeardownReport, TeardownStep};
pub use signaling::{HttpSignaling, SignalingResponse, SignalingTransport};
pub use sink::{LoggingMeter, LoggingSink};
#[cfg(feature = "webrtc-engine")]
pub use media_track::FileCapture;
#[cfg(feature = "webrtc-engine")]
pub use peer_connection::RtcEngine;

use std::error::Error;
use std::fmt;

/// WHIP/WHEP client errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhxpError {
    /// Endpoint rejected the offer method (HTTP 405), caller must fix the URL
    Configuration(String),
    /// Recoverable signaling failure (non-2xx status or transport error)
    TransientSignaling(String),
    /// Local capture devices could not be opened
    CaptureAcquisition(String),
    /// A teardown step failed
    Teardown(String),
    /// Session description could not be created or applied
    Sdp(String),
    /// Media engine operation failed
    Engine(String),
    /// Presentation sink rejected an operation
    Sink(String),
    /// Invalid configuration value
    InvalidConfig(String),
    /// Session already torn down
    SessionClosed,
}

impl fmt::Display for WhxpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhxpError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            WhxpError::TransientSignaling(msg) => write!(f, "Signaling error: {}", msg),
            WhxpError::CaptureAcquisition(msg) => write!(f, "Capture error: {}", msg),
            WhxpError::Teardown(msg) => write!(f, "Teardown error: {}", msg),
            WhxpError::Sdp(msg) => write!(f, "SDP error: {}", msg),
            WhxpError::Engine(msg) => write!(f, "Media engine error: {}", msg),
            WhxpError::Sink(msg) => write!(f, "Sink error: {}", msg),
            WhxpError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            WhxpError::SessionClosed => write!(f, "Session is closed"),
        }
    }
}

impl Error for WhxpError {}

