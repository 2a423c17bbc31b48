//! Common types used throughout the SFU implementation

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::config::SfuConfig;

/// Longest namespace, session name or user id kept after sanitization
pub const MAX_PARSED_LENGTH: usize = 50;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("Invalid sanitize regex"));

/// Unique identifier for a participant within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Registry key of a session, `origin#name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn qualified(origin: &str, name: &str) -> Self {
        Self(format!("{origin}#{name}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an inbound track, reused for its outbound copy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Outcome of a successful join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Created,
    Joined,
    Reconnected,
}

impl JoinStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Joined => "joined",
            Self::Reconnected => "reconnected",
        }
    }
}

impl fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Waiting for every inbound track
    Pending,
    /// Countdown running
    Running,
    /// Duration reached, grace period before deletion
    Ended,
    Deleted,
}

/// First message sent by a participant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JoinPayload {
    pub interaction_name: String,
    pub user_id: String,
    /// Seconds, 0 for the configured default
    pub duration: u64,
    pub namespace: String,
    pub video_format: String,
    pub recording_mode: String,
    /// Participants, 0 for the configured default
    pub size: usize,
    pub audio_fx: String,
    pub video_fx: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub gpu: bool,
    pub overlay: bool,
    /// Set by the server from the connection, never read from JSON
    #[serde(skip)]
    pub origin: String,
}

impl JoinPayload {
    /// Restrict every client-provided field to authorized values
    pub fn normalize(&mut self, origin: impl Into<String>, config: &SfuConfig) {
        self.namespace = sanitize(&self.namespace);
        self.interaction_name = sanitize(&self.interaction_name);
        self.user_id = sanitize(&self.user_id);
        if !matches!(self.video_format.as_str(), "VP8" | "H264") {
            self.video_format.clone_from(&config.default_video_format);
        }
        if !matches!(
            self.recording_mode.as_str(),
            "muxed" | "split" | "passthrough" | "none"
        ) {
            self.recording_mode.clone_from(&config.default_recording_mode);
        }
        if self.width == 0 {
            self.width = config.default_width;
        }
        if self.height == 0 {
            self.height = config.default_height;
        }
        if self.framerate == 0 {
            self.framerate = config.default_frame_rate;
        }
        self.origin = origin.into();
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        SessionId::qualified(&self.origin, &self.interaction_name)
    }

    #[must_use]
    pub fn user(&self) -> UserId {
        UserId::new(self.user_id.clone())
    }

    /// Requested size clamped to `[1, max_size]`
    #[must_use]
    pub fn effective_size(&self, config: &SfuConfig) -> usize {
        match self.size {
            0 => config.default_size,
            n => n.min(config.max_size),
        }
    }

    /// Requested duration (seconds) clamped to `[1, max_duration_secs]`
    #[must_use]
    pub fn effective_duration_secs(&self, config: &SfuConfig) -> u64 {
        match self.duration {
            0 => config.default_duration_secs,
            n => n.min(config.max_duration_secs),
        }
    }

    #[must_use]
    pub fn fx(&self, kind: TrackKind) -> &str {
        match kind {
            TrackKind::Audio => &self.audio_fx,
            TrackKind::Video => &self.video_fx,
        }
    }
}

/// Keep `[A-Za-z0-9_-]`, cap the length, fall back to `default`
#[must_use]
pub fn sanitize(input: &str) -> String {
    let clean = UNSAFE_CHARS.replace_all(input, "");
    if clean.is_empty() {
        return "default".to_string();
    }
    clean.chars().take(MAX_PARSED_LENGTH).collect()
}

/// Live effect change requested by a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    /// Track kind the effect lives on
    pub kind: TrackKind,
    /// Effect element name
    pub name: String,
    pub property: String,
    pub value: f32,
    /// Ramp duration in milliseconds, 0 applies immediately
    #[serde(default)]
    pub duration: u64,
}

/// Payload of `other_joined` / `other_left`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStream {
    pub user_id: String,
    pub stream_id: String,
}
