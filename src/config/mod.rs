//! Configuration management for whxp-client

use crate::whxp::{CodecPreferences, MediaKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    /// Signaling configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// ICE configuration
    #[serde(default)]
    pub ice: IceConfig,

    /// Codec preferences
    #[serde(default)]
    pub codecs: CodecConfig,

    /// Publish capture configuration
    #[serde(default)]
    pub publish: PublishConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Pause between failed negotiation attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl SignalingConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (e.g., "stun:stun.l.google.com:19302")
    pub urls: Vec<String>,

    /// Username for TURN
    #[serde(default)]
    pub username: Option<String>,

    /// Credential for TURN
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IceConfig {
    /// STUN/TURN servers; empty means host candidates only
    #[serde(default)]
    pub servers: Vec<IceServerConfig>,
}

/// Codec preference labels, `"<mime> <clock_rate> [fmtp]"` for audio and
/// `"<mime> [fmtp]"` for video
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodecConfig {
    #[serde(default)]
    pub audio: Option<String>,

    #[serde(default)]
    pub video: Option<String>,
}

impl CodecConfig {
    pub fn preferences(&self) -> Result<CodecPreferences, Box<dyn std::error::Error>> {
        Ok(CodecPreferences::from_labels(self.audio.as_deref(), self.video.as_deref())?)
    }

    pub fn label(&self, kind: MediaKind) -> Option<&str> {
        match kind {
            MediaKind::Audio => self.audio.as_deref(),
            MediaKind::Video => self.video.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Requested capture width
    #[serde(default = "default_video_width")]
    pub video_width: u32,

    /// Requested capture height
    #[serde(default = "default_video_height")]
    pub video_height: u32,

    /// Ogg/Opus file played as the audio track
    #[serde(default)]
    pub audio_file: Option<PathBuf>,

    /// H.264 Annex-B file played as the video track
    #[serde(default)]
    pub video_file: Option<PathBuf>,

    /// Interval between Ogg pages
    #[serde(default = "default_ogg_page_ms")]
    pub ogg_page_ms: u64,

    /// Interval between H.264 NAL units
    #[serde(default = "default_h264_frame_ms")]
    pub h264_frame_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            video_width: default_video_width(),
            video_height: default_video_height(),
            audio_file: None,
            video_file: None,
            ogg_page_ms: default_ogg_page_ms(),
            h264_frame_ms: default_h264_frame_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(ClientConfig::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.signaling.backoff_ms == 0 {
            return Err("Signaling backoff must be non-zero".into());
        }

        if self.signaling.request_timeout_ms == 0 {
            return Err("Signaling request timeout must be non-zero".into());
        }

        self.codecs.preferences()?;

        for server in &self.ice.servers {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                return Err("ICE server URLs must be non-empty".into());
            }
        }

        if self.publish.video_width == 0 || self.publish.video_height == 0 {
            return Err("Publish video dimensions must be non-zero".into());
        }

        if self.publish.ogg_page_ms == 0 || self.publish.h264_frame_ms == 0 {
            return Err("Publish pacing intervals must be non-zero".into());
        }

        Ok(())
    }
}


fn default_backoff_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_video_width() -> u32 {
    1280
}

fn default_video_height() -> u32 {
    720
}

fn default_ogg_page_ms() -> u64 {
    20
}

fn default_h264_frame_ms() -> u64 {
    41
}
