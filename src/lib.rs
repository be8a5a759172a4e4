//! whxp-client - WHIP/WHEP session client
//!
//! Negotiates publish (WHIP) and playback (WHEP) sessions against WebRTC
//! media servers and tears them down deterministically.

pub mod config;
pub mod whxp;

// Re-exports
pub use config::{ClientConfig, IceServerConfig, PublishConfig};
pub use whxp::{
    ConnectionState, HttpSignaling, MediaKind, SessionClient, SessionHandle, SessionMode, SessionOptions,
    SessionStatus, TeardownReport, WhxpError,
};
