//! In-memory transport and signaling fakes for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::util::marshal::Marshal;

use crate::error::{Error, Result};
use crate::transport::{InboundTrack, PeerTransport, RtcpPackets, RtpSender, Signaling};
use crate::types::{TrackId, TrackKind};

/// Records every message instead of sending it
#[derive(Default)]
pub struct FakeSignaling {
    messages: Mutex<Vec<(String, Option<Value>)>>,
}

impl FakeSignaling {
    pub fn kinds(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.messages.lock().iter().filter(|(k, _)| k == kind).count()
    }

    pub fn payloads(&self, kind: &str) -> Vec<Value> {
        self.messages
            .lock()
            .iter()
            .filter(|(k, _)| k == kind)
            .filter_map(|(_, p)| p.clone())
            .collect()
    }
}

impl Signaling for FakeSignaling {
    fn send(&self, kind: &str) -> Result<()> {
        self.messages.lock().push((kind.to_string(), None));
        Ok(())
    }

    fn send_with_payload(&self, kind: &str, payload: Value) -> Result<()> {
        self.messages.lock().push((kind.to_string(), Some(payload)));
        Ok(())
    }
}

/// RTCP arrives through the paired channel; closing it ends the sender
pub struct FakeSender {
    ssrcs: Vec<u32>,
    rtcp: tokio::sync::Mutex<mpsc::UnboundedReceiver<RtcpPackets>>,
}

impl FakeSender {
    pub fn new(ssrcs: Vec<u32>) -> (Arc<Self>, mpsc::UnboundedSender<RtcpPackets>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ssrcs,
                rtcp: tokio::sync::Mutex::new(rx),
            }),
            tx,
        )
    }
}

#[async_trait]
impl RtpSender for FakeSender {
    async fn encoding_ssrcs(&self) -> Vec<u32> {
        self.ssrcs.clone()
    }

    async fn read_rtcp(&self) -> Result<RtcpPackets> {
        self.rtcp.lock().await.recv().await.ok_or(Error::TrackClosed)
    }
}

/// Peer transport that tracks attached senders and counts calls
pub struct FakeTransport {
    sent: Mutex<Vec<TrackId>>,
    rtcp: Mutex<Vec<(TrackId, mpsc::UnboundedSender<RtcpPackets>)>>,
    encodings: usize,
    next_ssrc: AtomicU32,
    failing_offers: AtomicUsize,
    offers: AtomicUsize,
    plis: Mutex<Vec<u32>>,
    closes: AtomicUsize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::with_encodings(1)
    }
}

impl FakeTransport {
    pub fn with_encodings(encodings: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            rtcp: Mutex::new(Vec::new()),
            encodings,
            next_ssrc: AtomicU32::new(1000),
            failing_offers: AtomicUsize::new(0),
            offers: AtomicUsize::new(0),
            plis: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` offers fail
    pub fn fail_offers(&self, n: usize) {
        self.failing_offers.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<TrackId> {
        self.sent.lock().clone()
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn plis(&self) -> Vec<u32> {
        self.plis.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// RTCP channel of the sender attached for `track`
    pub fn rtcp_for(&self, track: &TrackId) -> Option<mpsc::UnboundedSender<RtcpPackets>> {
        self.rtcp
            .lock()
            .iter()
            .find(|(id, _)| id == track)
            .map(|(_, tx)| tx.clone())
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn sent_track_ids(&self) -> Vec<TrackId> {
        self.sent()
    }

    async fn remove_track(&self, id: &TrackId) -> Result<()> {
        self.sent.lock().retain(|sent| sent != id);
        self.rtcp.lock().retain(|(sent, _)| sent != id);
        Ok(())
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<Arc<dyn RtpSender>> {
        let id = TrackId::new(track.id());
        let ssrcs = (0..self.encodings)
            .map(|_| self.next_ssrc.fetch_add(1, Ordering::SeqCst))
            .collect();
        let (sender, tx) = FakeSender::new(ssrcs);
        self.sent.lock().push(id.clone());
        self.rtcp.lock().push((id, tx));
        Ok(sender)
    }

    async fn create_offer(&self) -> Result<String> {
        let failing = self
            .failing_offers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Transport("offer rejected".to_string()));
        }
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(r#"{"type":"offer","sdp":""}"#.to_string())
    }

    async fn send_pli(&self, media_ssrc: u32) -> Result<()> {
        self.plis.lock().push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Inbound track fed through the paired channel; dropping it ends the track
pub struct FakeTrack {
    id: TrackId,
    kind: TrackKind,
    ssrc: u32,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind, ssrc: u32) -> (Arc<Self>, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: TrackId::from(id),
                kind,
                ssrc,
                packets: tokio::sync::Mutex::new(rx),
            }),
            tx,
        )
    }
}

#[async_trait]
impl InboundTrack for FakeTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        match self.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let packet = self
            .packets
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::TrackClosed)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}

/// A marshalled RTP packet with `payload_len` payload bytes
pub fn rtp_packet(sequence_number: u16, payload_len: usize) -> Vec<u8> {
    let packet = Packet {
        header: Header {
            version: 2,
            payload_type: 96,
            sequence_number,
            timestamp: u32::from(sequence_number) * 3000,
            ssrc: 1,
            ..Default::default()
        },
        payload: vec![0xAB; payload_len].into(),
    };
    packet.marshal().map(|b| b.to_vec()).unwrap_or_default()
}
