use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The user is already connected to this session
    #[error("duplicate")]
    Duplicate,

    /// The session already knows `size` distinct users
    #[error("full")]
    Full,

    /// The session was deleted before the join landed
    #[error("Session deleted")]
    SessionDeleted,

    #[error("Track closed")]
    TrackClosed,

    #[error("Unsupported sender: {0}")]
    UnsupportedSender(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("RTP error: {0}")]
    Rtp(#[from] webrtc::util::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable string sent to clients as `error-<code>`
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Full => "full",
            _ => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
