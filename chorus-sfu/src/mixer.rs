//! Track fan-out across a session's participants

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::error::Result;
use crate::log::LogContext;
use crate::peer::PeerHandle;
use crate::session::Session;
use crate::slice::MixerSlice;
use crate::types::TrackId;

/// Index of a session's live slices, and the renegotiation that makes
/// every participant receive every other participant's tracks.
pub struct Mixer {
    session: Weak<Session>,
    slices: RwLock<HashMap<TrackId, Arc<MixerSlice>>>,
    /// Serializes renegotiation rounds
    signaling: tokio::sync::Mutex<()>,
    config: Arc<SfuConfig>,
    log: Arc<LogContext>,
}

impl Mixer {
    #[must_use]
    pub fn new(session: Weak<Session>, config: Arc<SfuConfig>, log: Arc<LogContext>) -> Self {
        Self {
            session,
            slices: RwLock::new(HashMap::new()),
            signaling: tokio::sync::Mutex::new(()),
            config,
            log,
        }
    }

    pub fn index_slice(&self, slice: Arc<MixerSlice>) {
        self.slices.write().insert(slice.id().clone(), slice);
    }

    /// Remove `slice` if it is still the one indexed under its id.
    ///
    /// Returns whether it was removed, so callers can count removals once.
    pub fn remove_slice(&self, slice: &Arc<MixerSlice>) -> bool {
        let mut slices = self.slices.write();
        if slices
            .get(slice.id())
            .is_some_and(|current| Arc::ptr_eq(current, slice))
        {
            slices.remove(slice.id());
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn slice(&self, id: &TrackId) -> Option<Arc<MixerSlice>> {
        self.slices.read().get(id).cloned()
    }

    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.read().len()
    }

    fn snapshot(&self) -> HashMap<TrackId, Arc<MixerSlice>> {
        self.slices.read().clone()
    }

    /// Renegotiate with every connected participant.
    ///
    /// A failed round is retried from scratch after the configured backoff
    /// until it succeeds or the session is deleted. With `with_keyframe`,
    /// every participant is asked for a keyframe once a round succeeds.
    pub async fn broadcast_signaling(&self, cause: &str, with_keyframe: bool) {
        let _round = self.signaling.lock().await;
        info!(parent: self.log.span(), cause, elapsed = %self.log.elapsed(), "Signaling update");

        loop {
            let Some(session) = self.session.upgrade() else {
                return;
            };
            if session.is_deleted() {
                debug!(parent: self.log.span(), cause, "Session deleted, signaling dropped");
                return;
            }

            let peers = session.connected_peers();
            let size = session.size();
            drop(session);

            match self.signal_round(size, &peers).await {
                Ok(()) => {
                    if with_keyframe {
                        for peer in &peers {
                            peer.forced_pli_request().await;
                        }
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        parent: self.log.span(),
                        cause,
                        error = %e,
                        retry_ms = self.config.signaling_retry_ms,
                        "Signaling round failed, retrying"
                    );
                }
            }

            tokio::time::sleep(self.config.signaling_retry()).await;
        }
    }

    async fn signal_round(&self, size: usize, peers: &[Arc<PeerHandle>]) -> Result<()> {
        let slices = self.snapshot();
        for peer in peers {
            self.sync_peer(size, &slices, peer).await?;
        }
        Ok(())
    }

    /// Bring one participant's outbound senders in line with the live slices
    /// and push a fresh offer.
    async fn sync_peer(
        &self,
        size: usize,
        slices: &HashMap<TrackId, Arc<MixerSlice>>,
        peer: &Arc<PeerHandle>,
    ) -> Result<()> {
        let transport = peer.transport();
        let sent: HashSet<TrackId> = transport.sent_track_ids().await.into_iter().collect();

        for id in sent.iter().filter(|id| !slices.contains_key(*id)) {
            transport.remove_track(id).await?;
            debug!(parent: self.log.span(), user = %peer.user(), track_id = %id, "Removed stale track");
        }

        // a single participant receives their own tracks back
        let mirror = size == 1;
        for (id, slice) in slices {
            if sent.contains(id) || (!mirror && slice.from_user() == peer.user()) {
                continue;
            }
            let sender = transport.add_track(slice.output()).await?;
            if let Err(e) = slice.add_sender(sender, peer.user().clone()).await {
                warn!(parent: self.log.span(), user = %peer.user(), track_id = %id, error = %e, "No bitrate control for sender");
            }
            debug!(parent: self.log.span(), user = %peer.user(), track_id = %id, "Added track");
        }

        let offer = transport.create_offer().await?;
        peer.signaling()
            .send_with_payload("offer", Value::String(offer))?;
        Ok(())
    }
}
