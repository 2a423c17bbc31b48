//! Media processing boundary
//!
//! A [`Pipeline`] receives the raw RTP of one inbound track, processes it
//! (decode, effects, re-encode, recording) and hands the resulting RTP to a
//! [`PacketSink`]. The SFU only relies on this contract.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::error::{Error, Result};
use crate::types::{TrackKind, UserId};

/// Everything a pipeline needs to know about the track it processes
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub kind: TrackKind,
    pub codec: RTCRtpCodecCapability,
    pub user: UserId,
    pub fx: String,
    pub video_format: String,
    pub recording_mode: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Hardware encoding requested by the participant
    pub gpu: bool,
    pub overlay: bool,
    /// Prefix for recording file names, unique per session and user
    pub file_prefix: String,
}

/// Destination of processed RTP
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Write one marshalled RTP packet
    async fn write(&self, buf: &[u8]) -> Result<()>;

    /// The encoder needs a fresh keyframe from the original sender
    fn request_keyframe(&self);
}

#[cfg_attr(test, mockall::automock)]
pub trait Pipeline: Send + Sync {
    fn start(&self) -> Result<()>;

    fn stop(&self);

    fn push(&self, buf: &[u8]);

    /// Target encoding bitrate in bits per second
    fn set_encoding_rate(&self, bitrate: u64);

    fn set_fx_property(&self, name: &str, property: &str, value: f32);

    fn get_fx_property(&self, name: &str, property: &str) -> f32;

    fn recording_files(&self) -> Vec<String>;
}

#[cfg_attr(test, mockall::automock)]
pub trait PipelineFactory: Send + Sync {
    fn create(&self, spec: PipelineSpec, sink: Arc<dyn PacketSink>) -> Result<Arc<dyn Pipeline>>;
}

/// Forwards RTP untouched and only remembers control values
pub struct PassthroughPipeline {
    spec: PipelineSpec,
    sink: Arc<dyn PacketSink>,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    fx: Mutex<HashMap<(String, String), f32>>,
    encoding_rate: AtomicU64,
}

impl PassthroughPipeline {
    #[must_use]
    pub fn new(spec: PipelineSpec, sink: Arc<dyn PacketSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            spec,
            sink,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            fx: Mutex::new(HashMap::new()),
            encoding_rate: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn encoding_rate(&self) -> u64 {
        self.encoding_rate.load(Ordering::Relaxed)
    }
}

impl Pipeline for PassthroughPipeline {
    fn start(&self) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::Pipeline("pipeline already started".to_string()))?;
        let sink = Arc::clone(&self.sink);
        let user = self.spec.user.clone();
        let kind = self.spec.kind;

        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if let Err(e) = sink.write(&buf).await {
                    warn!(user = %user, kind = %kind, error = %e, "Pipeline sink write failed");
                }
            }
            debug!(user = %user, kind = %kind, "Pipeline drained");
        });

        if self.spec.kind == TrackKind::Video {
            self.sink.request_keyframe();
        }
        Ok(())
    }

    fn stop(&self) {
        self.tx.lock().take();
    }

    fn push(&self, buf: &[u8]) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // a closed receiver means the pipeline stopped, late packets are dropped
            let _ = tx.send(Bytes::copy_from_slice(buf));
        }
    }

    fn set_encoding_rate(&self, bitrate: u64) {
        self.encoding_rate.store(bitrate, Ordering::Relaxed);
    }

    fn set_fx_property(&self, name: &str, property: &str, value: f32) {
        self.fx
            .lock()
            .insert((name.to_string(), property.to_string()), value);
    }

    fn get_fx_property(&self, name: &str, property: &str) -> f32 {
        self.fx
            .lock()
            .get(&(name.to_string(), property.to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn recording_files(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Creates a [`PassthroughPipeline`] per track
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughFactory;

impl PipelineFactory for PassthroughFactory {
    fn create(&self, spec: PipelineSpec, sink: Arc<dyn PacketSink>) -> Result<Arc<dyn Pipeline>> {
        Ok(Arc::new(PassthroughPipeline::new(spec, sink)))
    }
}
