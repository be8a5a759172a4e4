//! Codec preference handling
//!
//! A preference names one codec per media kind. Applying it moves the
//! matching entry of the engine's capability list to the front and keeps
//! the relative order of everything else; nothing is ever filtered out.

use super::engine::{CodecCapability, MediaKind};
use super::WhxpError;
use std::fmt;

/// Codecs that are not selectable on their own
const AUXILIARY_CODECS: &[&str] = &[
    "audio/CN",
    "audio/telephone-event",
    "video/red",
    "video/ulpfec",
    "video/rtx",
];

/// Preferred codec for one media kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPreference {
    pub kind: MediaKind,
    pub mime_type: String,
    /// Only compared for audio
    pub clock_rate: Option<u32>,
    pub sdp_fmtp_line: String,
}

impl CodecPreference {
    /// Parse a preference label.
    ///
    /// Audio labels are `"<mime> <clock_rate> [fmtp]"`, video labels are
    /// `"<mime> [fmtp]"`, the same text [`CodecPreference::label`] produces.
    pub fn parse(kind: MediaKind, label: &str) -> Result<Self, WhxpError> {
        let label = label.trim();
        match kind {
            MediaKind::Audio => {
                let mut parts = label.splitn(3, ' ');
                let mime_type = parts.next().unwrap_or_default();
                let clock_rate = parts
                    .next()
                    .ok_or_else(|| WhxpError::InvalidConfig(format!("Audio codec '{}' is missing a clock rate", label)))?
                    .parse::<u32>()
                    .map_err(|e| WhxpError::InvalidConfig(format!("Audio codec '{}' has an invalid clock rate: {}", label, e)))?;
                let sdp_fmtp_line = parts.next().unwrap_or_default().trim();
                Self::build(kind, mime_type, Some(clock_rate), sdp_fmtp_line)
            }
            MediaKind::Video => {
                let mut parts = label.splitn(2, ' ');
                let mime_type = parts.next().unwrap_or_default();
                let sdp_fmtp_line = parts.next().unwrap_or_default().trim();
                Self::build(kind, mime_type, None, sdp_fmtp_line)
            }
        }
    }

    fn build(kind: MediaKind, mime_type: &str, clock_rate: Option<u32>, sdp_fmtp_line: &str) -> Result<Self, WhxpError> {
        let prefix = format!("{}/", kind.as_str());
        if mime_type.len() <= prefix.len() || !mime_type.to_ascii_lowercase().starts_with(&prefix) {
            return Err(WhxpError::InvalidConfig(format!(
                "Codec '{}' is not a {} mime type",
                mime_type, kind
            )));
        }
        Ok(Self {
            kind,
            mime_type: mime_type.to_string(),
            clock_rate,
            sdp_fmtp_line: sdp_fmtp_line.to_string(),
        })
    }

    /// Selection label for a capability, in the format [`CodecPreference::parse`] accepts
    pub fn label(kind: MediaKind, codec: &CodecCapability) -> String {
        let label = match kind {
            MediaKind::Audio => format!("{} {} {}", codec.mime_type, codec.clock_rate, codec.sdp_fmtp_line),
            MediaKind::Video => format!("{} {}", codec.mime_type, codec.sdp_fmtp_line),
        };
        label.trim().to_string()
    }

    pub fn matches(&self, codec: &CodecCapability) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(&codec.mime_type) {
            return false;
        }
        if let Some(rate) = self.clock_rate {
            if rate != codec.clock_rate {
                return false;
            }
        }
        self.sdp_fmtp_line == codec.sdp_fmtp_line
    }

    /// Move the preferred codec to the front of `codecs`.
    ///
    /// Returns `false` and leaves the list untouched when no entry matches.
    pub fn apply(&self, codecs: &mut Vec<CodecCapability>) -> bool {
        match codecs.iter().position(|c| self.matches(c)) {
            Some(index) => {
                let selected = codecs.remove(index);
                codecs.insert(0, selected);
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for CodecPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.clock_rate {
            Some(rate) => format!("{} {} {}", self.mime_type, rate, self.sdp_fmtp_line),
            None => format!("{} {}", self.mime_type, self.sdp_fmtp_line),
        };
        f.write_str(label.trim())
    }
}

/// At most one preference per media kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecPreferences {
    pub audio: Option<CodecPreference>,
    pub video: Option<CodecPreference>,
}

impl CodecPreferences {
    /// Build from optional labels; empty labels mean "no preference"
    pub fn from_labels(audio: Option<&str>, video: Option<&str>) -> Result<Self, WhxpError> {
        let audio = match audio.map(str::trim).filter(|s| !s.is_empty()) {
            Some(label) => Some(CodecPreference::parse(MediaKind::Audio, label)?),
            None => None,
        };
        let video = match video.map(str::trim).filter(|s| !s.is_empty()) {
            Some(label) => Some(CodecPreference::parse(MediaKind::Video, label)?),
            None => None,
        };
        Ok(Self { audio, video })
    }

    pub fn for_kind(&self, kind: MediaKind) -> Option<&CodecPreference> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Labels of the codecs a user can pick for `kind`
pub fn selectable_labels(kind: MediaKind, codecs: &[CodecCapability]) -> Vec<String> {
    codecs
        .iter()
        .filter(|c| !AUXILIARY_CODECS.iter().any(|aux| aux.eq_ignore_ascii_case(&c.mime_type)))
        .map(|c| CodecPreference::label(kind, c))
        .collect()
}
