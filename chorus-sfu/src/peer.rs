//! One participant's connection to a session

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SfuConfig;
use crate::signal::Signal;
use crate::slice::MixerSlice;
use crate::transport::{PeerTransport, Signaling};
use crate::types::{ControlPayload, JoinPayload, TrackKind, UserId, UserStream};

/// Signaling and transport of a single participant.
///
/// Owns the stream id shared by the participant's audio and video outbound
/// tracks and throttles keyframe requests sent toward the participant.
pub struct PeerHandle {
    user: UserId,
    stream_id: String,
    join: JoinPayload,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn Signaling>,
    video_ssrcs: Mutex<Vec<u32>>,
    last_pli: Mutex<Option<Instant>>,
    pli_throttle: Duration,
    slices: RwLock<HashMap<TrackKind, Weak<MixerSlice>>>,
    closed: Signal,
}

impl PeerHandle {
    #[must_use]
    pub fn new(
        join: JoinPayload,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn Signaling>,
        config: &SfuConfig,
    ) -> Self {
        Self {
            user: join.user(),
            stream_id: Uuid::new_v4().to_string(),
            join,
            transport,
            signaling,
            video_ssrcs: Mutex::new(Vec::new()),
            last_pli: Mutex::new(None),
            pli_throttle: config.pli_throttle(),
            slices: RwLock::new(HashMap::new()),
            closed: Signal::new(),
        }
    }

    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub const fn join(&self) -> &JoinPayload {
        &self.join
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    #[must_use]
    pub const fn closed(&self) -> &Signal {
        &self.closed
    }

    #[must_use]
    pub fn user_stream(&self) -> UserStream {
        UserStream {
            user_id: self.user.to_string(),
            stream_id: self.stream_id.clone(),
        }
    }

    /// Send a bare message; failures only mean the peer is going away
    pub fn send(&self, kind: &str) {
        if let Err(e) = self.signaling.send(kind) {
            debug!(user = %self.user, kind, error = %e, "Signaling send failed");
        }
    }

    pub fn send_with_payload(&self, kind: &str, payload: Value) {
        if let Err(e) = self.signaling.send_with_payload(kind, payload) {
            debug!(user = %self.user, kind, error = %e, "Signaling send failed");
        }
    }

    pub(crate) fn signaling(&self) -> &Arc<dyn Signaling> {
        &self.signaling
    }

    /// Remember an inbound track SSRC so keyframe requests can target it
    pub fn add_inbound_track(&self, kind: TrackKind, ssrc: u32) {
        if kind == TrackKind::Video {
            self.video_ssrcs.lock().push(ssrc);
        }
    }

    pub(crate) fn set_slice(&self, kind: TrackKind, slice: &Arc<MixerSlice>) {
        self.slices.write().insert(kind, Arc::downgrade(slice));
    }

    #[must_use]
    pub fn slice(&self, kind: TrackKind) -> Option<Arc<MixerSlice>> {
        self.slices.read().get(&kind).and_then(Weak::upgrade)
    }

    /// Route a live effect change to the slice of the requested kind
    pub fn control_fx(&self, payload: ControlPayload) {
        match self.slice(payload.kind) {
            Some(slice) => slice.control_fx(payload),
            None => debug!(user = %self.user, kind = %payload.kind, "No slice for control"),
        }
    }

    /// Request a keyframe unless one was requested within the throttle window.
    ///
    /// Returns whether a request was sent.
    pub async fn throttled_pli_request(&self) -> bool {
        {
            let mut last = self.last_pli.lock();
            let now = Instant::now();
            match *last {
                Some(previous) if now.duration_since(previous) < self.pli_throttle => return false,
                _ => *last = Some(now),
            }
        }
        self.send_pli().await;
        true
    }

    /// Request a keyframe regardless of the throttle window
    pub async fn forced_pli_request(&self) {
        *self.last_pli.lock() = Some(Instant::now());
        self.send_pli().await;
    }

    async fn send_pli(&self) {
        let ssrcs = self.video_ssrcs.lock().clone();
        for ssrc in ssrcs {
            if let Err(e) = self.transport.send_pli(ssrc).await {
                warn!(user = %self.user, ssrc, error = %e, "Failed to send PLI");
            }
        }
    }

    /// Close the transport; only the first call has an effect
    pub async fn close(&self, reason: &str) {
        if !self.closed.fire() {
            return;
        }
        info!(user = %self.user, reason, "Closing peer");
        if let Err(e) = self.transport.close().await {
            debug!(user = %self.user, error = %e, "Transport close failed");
        }
    }
}
