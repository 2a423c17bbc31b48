//! A fixed-size, time-boxed session
//!
//! Lifecycle: `Pending -> Running -> Ended -> Deleted`, or `Pending ->
//! Deleted` when everyone leaves before it starts.
//!
//! A session becomes Running the first time every expected inbound track
//! (one audio and one video per participant) has arrived. It then counts
//! down its duration, ends, and is deleted after a grace period.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::log::LogContext;
use crate::mixer::Mixer;
use crate::peer::PeerHandle;
use crate::pipeline::PipelineFactory;
use crate::registry::{SessionRegistry, SsrcEntry};
use crate::signal::Signal;
use crate::slice::MixerSlice;
use crate::transport::InboundTrack;
use crate::types::{JoinPayload, JoinStatus, SessionId, SessionState, TrackKind, UserId};

struct SessionInner {
    /// Absent: never joined, false: left, true: connected
    connected: HashMap<UserId, bool>,
    joined_count: HashMap<UserId, u32>,
    peers: HashMap<UserId, Arc<PeerHandle>>,
    files: HashMap<UserId, Vec<String>>,
    ssrcs: Vec<u32>,
    in_tracks_ready: usize,
    out_tracks_ready: usize,
    state: SessionState,
    started_at: Option<Instant>,
}

pub struct Session {
    id: SessionId,
    origin: String,
    namespace: String,
    name: String,
    size: usize,
    duration: Duration,
    needed_tracks: usize,
    created_at: DateTime<Utc>,
    config: Arc<SfuConfig>,
    registry: Weak<SessionRegistry>,
    factory: Arc<dyn PipelineFactory>,
    mixer: Arc<Mixer>,
    log: Arc<LogContext>,
    inner: Mutex<SessionInner>,
    all_ready: Signal,
    ended: Signal,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with its first participant already connected
    pub(crate) fn new(
        payload: &JoinPayload,
        config: Arc<SfuConfig>,
        registry: Weak<SessionRegistry>,
        factory: Arc<dyn PipelineFactory>,
    ) -> Arc<Self> {
        let size = payload.effective_size(&config);
        let duration = Duration::from_secs(payload.effective_duration_secs(&config));
        let log = Arc::new(LogContext::new(&payload.namespace, &payload.interaction_name));
        let user = payload.user();

        let session = Arc::new_cyclic(|weak| Self {
            id: payload.session_id(),
            origin: payload.origin.clone(),
            namespace: payload.namespace.clone(),
            name: payload.interaction_name.clone(),
            size,
            duration,
            needed_tracks: size * 2,
            created_at: Utc::now(),
            mixer: Arc::new(Mixer::new(weak.clone(), Arc::clone(&config), Arc::clone(&log))),
            config,
            registry,
            factory,
            log,
            inner: Mutex::new(SessionInner {
                connected: HashMap::from([(user.clone(), true)]),
                joined_count: HashMap::from([(user, 1)]),
                peers: HashMap::new(),
                files: HashMap::new(),
                ssrcs: Vec::new(),
                in_tracks_ready: 0,
                out_tracks_ready: 0,
                state: SessionState::Pending,
                started_at: None,
            }),
            all_ready: Signal::new(),
            ended: Signal::new(),
        });

        info!(
            parent: session.log.span(),
            id = %session.id,
            origin = %session.origin,
            user = %payload.user_id,
            size,
            duration_secs = duration.as_secs(),
            "Session created"
        );
        session
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub const fn needed_tracks(&self) -> usize {
        self.needed_tracks
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    #[must_use]
    pub const fn log(&self) -> &Arc<LogContext> {
        &self.log
    }

    /// Fires once every expected inbound track has arrived
    #[must_use]
    pub const fn all_ready(&self) -> &Signal {
        &self.all_ready
    }

    /// Fires when the session ends, aborts or is deleted
    #[must_use]
    pub const fn ended(&self) -> &Signal {
        &self.ended
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state() == SessionState::Deleted
    }

    #[must_use]
    pub fn joined_count(&self, user: &UserId) -> u32 {
        self.inner.lock().joined_count.get(user).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_connected(&self, user: &UserId) -> bool {
        self.inner.lock().connected.get(user).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.inner.lock().connected.values().filter(|c| **c).count()
    }

    #[must_use]
    pub fn connected_peers(&self) -> Vec<Arc<PeerHandle>> {
        self.inner.lock().peers.values().cloned().collect()
    }

    #[must_use]
    pub fn in_tracks_ready(&self) -> usize {
        self.inner.lock().in_tracks_ready
    }

    #[must_use]
    pub fn out_tracks_ready(&self) -> usize {
        self.inner.lock().out_tracks_ready
    }

    /// Recording files per user
    #[must_use]
    pub fn files(&self) -> HashMap<UserId, Vec<String>> {
        self.inner.lock().files.clone()
    }

    /// Whole seconds left before the end, the full duration until started
    #[must_use]
    pub fn remaining_seconds(&self) -> u64 {
        let started_at = self.inner.lock().started_at;
        started_at.map_or(self.duration.as_secs(), |started| {
            self.duration.saturating_sub(started.elapsed()).as_secs()
        })
    }

    /// Prefix for the recording files of `user`'s current connection
    #[must_use]
    pub fn file_prefix(&self, user: &UserId) -> String {
        format!(
            "{}-{}-{}-{}",
            self.namespace,
            self.name,
            user,
            self.joined_count(user)
        )
    }

    /// Admit `user` into an existing session.
    ///
    /// Errors leave the session untouched.
    pub(crate) fn join_user(&self, payload: &JoinPayload) -> Result<JoinStatus> {
        let user = payload.user();
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Deleted {
            return Err(Error::SessionDeleted);
        }

        match inner.connected.get(&user).copied() {
            Some(true) => Err(Error::Duplicate),
            Some(false) => {
                inner.connected.insert(user.clone(), true);
                *inner.joined_count.entry(user.clone()).or_insert(0) += 1;
                info!(parent: self.log.span(), user = %user, count = inner.joined_count[&user], "Peer reconnected");
                Ok(JoinStatus::Reconnected)
            }
            None if inner.connected.len() >= self.size => Err(Error::Full),
            None => {
                inner.connected.insert(user.clone(), true);
                inner.joined_count.insert(user.clone(), 1);
                info!(parent: self.log.span(), user = %user, "Peer joined");
                Ok(JoinStatus::Joined)
            }
        }
    }

    /// Register the participant's connection, introduce it to the others and
    /// start the negotiation that lets it publish.
    ///
    /// A first join also asks every participant for a keyframe once the
    /// round succeeds.
    pub fn connect_peer(self: &Arc<Self>, peer: Arc<PeerHandle>) {
        let first_join = {
            let mut inner = self.inner.lock();
            for other in inner.peers.values() {
                other.send_with_payload("other_joined", json!(peer.user_stream()));
                peer.send_with_payload("other_joined", json!(other.user_stream()));
            }
            let first_join = inner.joined_count.get(peer.user()).copied().unwrap_or(1) <= 1;
            inner.peers.insert(peer.user().clone(), peer);
            first_join
        };

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session
                .mixer
                .broadcast_signaling("peer_connected", first_join)
                .await;
        });
    }

    /// Count one more inbound track; the last expected one starts the session.
    ///
    /// Once the session is complete, a reconnecting participant's audio track
    /// only earns that participant a `start` message.
    pub fn inc_in_tracks_ready(self: &Arc<Self>, peer: &PeerHandle, kind: TrackKind) {
        let mut inner = self.inner.lock();

        if inner.in_tracks_ready == self.needed_tracks {
            if kind == TrackKind::Audio {
                peer.send_with_payload("start", json!(self.remaining_seconds_locked(&inner)));
            }
            return;
        }

        inner.in_tracks_ready += 1;
        info!(
            parent: self.log.span(),
            user = %peer.user(),
            count = inner.in_tracks_ready,
            needed = self.needed_tracks,
            "In track ready"
        );

        if inner.in_tracks_ready == self.needed_tracks && self.all_ready.fire() {
            inner.state = SessionState::Running;
            inner.started_at = Some(self.log.mark_started());
            let remaining = self.remaining_seconds_locked(&inner);
            for other in inner.peers.values() {
                other.send_with_payload("start", json!(remaining));
            }
            drop(inner);

            info!(parent: self.log.span(), elapsed = %self.log.elapsed(), "Session started");
            tokio::spawn(Arc::clone(self).countdown().instrument(self.log.span().clone()));
        }
    }

    fn remaining_seconds_locked(&self, inner: &SessionInner) -> u64 {
        inner.started_at.map_or(self.duration.as_secs(), |started| {
            self.duration.saturating_sub(started.elapsed()).as_secs()
        })
    }

    async fn countdown(self: Arc<Self>) {
        let notice = Duration::from_secs(self.config.ending_notice_secs);
        let ending_in = self.duration.saturating_sub(notice).max(Duration::from_secs(1));

        tokio::select! {
            () = tokio::time::sleep(ending_in) => {
                for peer in self.connected_peers() {
                    peer.send("ending");
                }
                tokio::time::sleep(self.duration.saturating_sub(ending_in)).await;
            }
            () = self.ended.wait() => return,
        }

        info!(parent: self.log.span(), elapsed = %self.log.elapsed(), "Countdown reached");
        self.end();
        tokio::time::sleep(self.config.end_grace()).await;
        self.delete();
    }

    /// Tear the session down if it is not complete in time
    pub(crate) fn spawn_abort_timer(self: &Arc<Self>, after: Duration) {
        let session = Arc::clone(self);
        tokio::spawn(
            async move {
                tokio::select! {
                    () = session.all_ready.wait() => return,
                    () = session.ended.wait() => return,
                    () = tokio::time::sleep(after) => {}
                }
                warn!(parent: session.log.span(), elapsed = %session.log.elapsed(), "Session aborted, tracks missing");
                session.end();
                tokio::time::sleep(session.config.end_grace()).await;
                session.delete();
            }
            .instrument(self.log.span().clone()),
        );
    }

    fn end(&self) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Pending | SessionState::Running) {
                inner.state = SessionState::Ended;
            }
        }
        if self.ended.fire() {
            info!(parent: self.log.span(), "Session ended");
        }
    }

    /// Count one more outbound track; triggers renegotiation when all are
    /// ready, or on every audio/video pair once running.
    pub fn inc_out_tracks_ready(self: &Arc<Self>) {
        let trigger = {
            let mut inner = self.inner.lock();
            inner.out_tracks_ready += 1;
            inner.out_tracks_ready == self.needed_tracks
                || (inner.state == SessionState::Running && inner.out_tracks_ready % 2 == 0)
        };

        if trigger {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(session.config.signaling_settle()).await;
                session
                    .mixer
                    .broadcast_signaling("out_tracks_ready", true)
                    .await;
            });
        }
    }

    pub fn dec_out_tracks_ready(&self) {
        let mut inner = self.inner.lock();
        inner.out_tracks_ready = inner.out_tracks_ready.saturating_sub(1);
    }

    /// Mark `user` as gone. Idempotent.
    ///
    /// Deletes the session when nobody is left and it is not running;
    /// otherwise renegotiates so the others stop receiving the user's tracks.
    pub fn disconnect_user(self: &Arc<Self>, user: &UserId) {
        let delete = {
            let mut inner = self.inner.lock();
            if !inner.connected.get(user).copied().unwrap_or(false) {
                return;
            }
            inner.connected.insert(user.clone(), false);
            if let Some(peer) = inner.peers.remove(user) {
                for other in inner.peers.values() {
                    other.send_with_payload("other_left", json!(peer.user_stream()));
                }
            }
            info!(parent: self.log.span(), user = %user, "Peer left");

            let empty = inner.connected.values().all(|c| !c);
            empty && inner.state != SessionState::Running
        };

        if delete {
            self.delete();
        } else if !self.is_deleted() {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session
                    .mixer
                    .broadcast_signaling("user_disconnected", false)
                    .await;
            });
        }
    }

    /// Remove the session from its registry; only the first call acts
    pub fn delete(&self) -> bool {
        let ssrcs = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Deleted {
                return false;
            }
            inner.state = SessionState::Deleted;
            std::mem::take(&mut inner.ssrcs)
        };
        self.ended.fire();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
            registry.remove_ssrcs(&ssrcs);
        }
        info!(parent: self.log.span(), elapsed = %self.log.elapsed(), "Session deleted");
        true
    }

    fn add_ssrc(&self, kind: TrackKind, ssrc: u32, user: &UserId) {
        self.inner.lock().ssrcs.push(ssrc);
        if let Some(registry) = self.registry.upgrade() {
            registry.add_ssrc(
                ssrc,
                SsrcEntry {
                    kind,
                    namespace: self.namespace.clone(),
                    session: self.name.clone(),
                    user: user.clone(),
                },
            );
        }
    }

    fn add_files(&self, user: &UserId, files: Vec<String>) {
        if files.is_empty() {
            return;
        }
        self.inner
            .lock()
            .files
            .entry(user.clone())
            .or_default()
            .extend(files);
    }

    /// Discard inbound RTP until the session is complete.
    ///
    /// Returns false when the session ends, the participant leaves or the
    /// track fails first.
    async fn wait_all_ready(&self, peer: &PeerHandle, track: &dyn InboundTrack) -> bool {
        let mut buf = vec![0u8; self.config.mtu];
        loop {
            tokio::select! {
                biased;
                () = self.all_ready.wait() => return true,
                () = self.ended.wait() => return false,
                () = peer.closed().wait() => return false,
                read = track.read(&mut buf) => {
                    if let Err(e) = read {
                        debug!(parent: self.log.span(), user = %peer.user(), error = %e, "Track failed before start");
                        return false;
                    }
                }
            }
        }
    }

    /// Handle one inbound track from arrival to teardown
    pub async fn run_slice(self: Arc<Self>, peer: Arc<PeerHandle>, track: Arc<dyn InboundTrack>) {
        let kind = track.kind();
        let user = peer.user().clone();
        self.add_ssrc(kind, track.ssrc(), &user);
        peer.add_inbound_track(kind, track.ssrc());
        self.inc_in_tracks_ready(&peer, kind);

        let slice = MixerSlice::new(
            Arc::clone(&peer),
            Arc::clone(&track),
            self.ended.clone(),
            Arc::clone(&self.config),
            self.file_prefix(&user),
            self.log.track_span(&user, kind),
        );
        peer.set_slice(kind, &slice);

        if !self.wait_all_ready(&peer, track.as_ref()).await {
            return;
        }

        self.mixer.index_slice(Arc::clone(&slice));
        self.inc_out_tracks_ready();

        let files = Arc::clone(&slice).run(Arc::clone(&self.factory)).await;
        self.add_files(&user, files);

        if self.mixer.remove_slice(&slice) {
            self.dec_out_tracks_ready();
        }
    }
}
