//! `webrtc` implementations of the transport capabilities

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

use crate::error::Result;
use crate::transport::{InboundTrack, PeerTransport, RtcpPackets, RtpSender};
use crate::types::{TrackId, TrackKind};

/// Build the `webrtc` API with default codecs and interceptors
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Create a peer connection ready to receive one audio and one video track
pub async fn new_peer_connection(api: &API, stun_urls: &[String]) -> Result<Arc<RTCPeerConnection>> {
    let ice_servers = if stun_urls.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: stun_urls.to_vec(),
            ..Default::default()
        }]
    };

    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?,
    );

    for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;
    }

    Ok(pc)
}

/// Inbound track backed by a `TrackRemote`
pub struct RemoteTrack(Arc<TrackRemote>);

impl RemoteTrack {
    #[must_use]
    pub const fn new(track: Arc<TrackRemote>) -> Self {
        Self(track)
    }
}

#[async_trait]
impl InboundTrack for RemoteTrack {
    fn id(&self) -> TrackId {
        TrackId::new(self.0.id())
    }

    fn kind(&self) -> TrackKind {
        TrackKind::from(self.0.kind())
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.0.codec().capability
    }

    fn ssrc(&self) -> u32 {
        self.0.ssrc()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (packet, _attributes) = self.0.read(buf).await?;
        Ok(packet.header.marshal_size() + packet.payload.len())
    }
}

/// Outbound sender backed by an `RTCRtpSender`
pub struct WebrtcSender(Arc<RTCRtpSender>);

#[async_trait]
impl RtpSender for WebrtcSender {
    async fn encoding_ssrcs(&self) -> Vec<u32> {
        self.0
            .get_parameters()
            .await
            .encodings
            .iter()
            .map(|encoding| encoding.ssrc)
            .collect()
    }

    async fn read_rtcp(&self) -> Result<RtcpPackets> {
        let (packets, _attributes) = self.0.read_rtcp().await?;
        Ok(packets)
    }
}

/// Peer transport backed by an `RTCPeerConnection`
pub struct WebrtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebrtcPeer {
    #[must_use]
    pub const fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc }
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerTransport for WebrtcPeer {
    async fn sent_track_ids(&self) -> Vec<TrackId> {
        let mut ids = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(TrackId::new(track.id()));
            }
        }
        ids
    }

    async fn remove_track(&self, id: &TrackId) -> Result<()> {
        for sender in self.pc.get_senders().await {
            let matches = sender
                .track()
                .await
                .is_some_and(|track| track.id() == id.as_str());
            if matches {
                self.pc.remove_track(&sender).await?;
            }
        }
        Ok(())
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<Arc<dyn RtpSender>> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(Arc::new(WebrtcSender(sender)))
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_string(&offer)?)
    }

    async fn send_pli(&self, media_ssrc: u32) -> Result<()> {
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await?;
        debug!(media_ssrc, "Sent PLI");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
