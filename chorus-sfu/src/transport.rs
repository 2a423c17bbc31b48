//! Capabilities the SFU needs from the WebRTC stack and the signaling channel
//!
//! The session logic only talks to these traits. [`crate::rtc`] implements
//! them on top of `webrtc` types; tests implement them with in-memory fakes.

use async_trait::async_trait;
use std::sync::Arc;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::Result;
use crate::types::{TrackId, TrackKind};

pub type RtcpPackets = Vec<Box<dyn RtcpPacket + Send + Sync>>;

/// A media track received from a participant
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn id(&self) -> TrackId;

    fn kind(&self) -> TrackKind;

    fn codec(&self) -> RTCRtpCodecCapability;

    fn ssrc(&self) -> u32;

    /// Read one RTP packet into `buf`, returning its size.
    ///
    /// An error means the track is gone and no further reads will succeed.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
}

/// The sending side of one outbound track toward one participant
#[async_trait]
pub trait RtpSender: Send + Sync {
    /// SSRC of every negotiated encoding
    async fn encoding_ssrcs(&self) -> Vec<u32>;

    /// Next batch of RTCP feedback from the receiving participant
    async fn read_rtcp(&self) -> Result<RtcpPackets>;
}

/// One participant's peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ids of the tracks currently attached to an outbound sender
    async fn sent_track_ids(&self) -> Vec<TrackId>;

    async fn remove_track(&self, id: &TrackId) -> Result<()>;

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<Arc<dyn RtpSender>>;

    /// Create an offer, set it as local description and return it as JSON
    async fn create_offer(&self) -> Result<String>;

    /// Ask the remote sender of `media_ssrc` for a keyframe
    async fn send_pli(&self, media_ssrc: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Outbound half of a participant's signaling channel
pub trait Signaling: Send + Sync {
    fn send(&self, kind: &str) -> Result<()>;

    fn send_with_payload(&self, kind: &str, payload: serde_json::Value) -> Result<()>;
}
