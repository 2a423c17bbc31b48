//! Process-wide session registry
//!
//! Maps `origin#name` to the live session and keeps an SSRC index used to
//! attribute RTP streams to their session and participant.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::pipeline::PipelineFactory;
use crate::session::Session;
use crate::types::{JoinPayload, JoinStatus, SessionId, SessionState, TrackKind, UserId};

/// Owner of an inbound SSRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcEntry {
    pub kind: TrackKind,
    pub namespace: String,
    pub session: String,
    pub user: UserId,
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Sessions in the registry
    pub sessions: usize,
    /// Sessions whose countdown is running
    pub running: usize,
    /// Participants currently connected across all sessions
    pub connected_peers: usize,
    /// Known inbound SSRCs
    pub ssrcs: usize,
}

pub struct SessionRegistry {
    config: Arc<SfuConfig>,
    factory: Arc<dyn PipelineFactory>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    ssrcs: DashMap<u32, SsrcEntry>,
}

impl SessionRegistry {
    pub fn new(config: SfuConfig, factory: Arc<dyn PipelineFactory>) -> Arc<Self> {
        info!(
            max_size = config.max_size,
            max_duration_secs = config.max_duration_secs,
            "Session registry initialized"
        );
        Arc::new(Self {
            config: Arc::new(config),
            factory,
            sessions: Mutex::new(HashMap::new()),
            ssrcs: DashMap::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<SfuConfig> {
        &self.config
    }

    /// Admit a participant, creating the session if it does not exist.
    ///
    /// `payload` must already be normalized. Lookup and creation happen under
    /// one lock, so concurrent first joins share a single session. A deleted
    /// session still in the map is replaced.
    pub fn join(self: &Arc<Self>, payload: &JoinPayload) -> Result<(Arc<Session>, JoinStatus)> {
        let id = payload.session_id();
        let mut sessions = self.sessions.lock();

        if let Some(session) = sessions.get(&id).filter(|s| !s.is_deleted()) {
            match session.join_user(payload) {
                Err(Error::SessionDeleted) => {
                    debug!(id = %id, "Session deleted during join, replacing it");
                }
                joined => return joined.map(|status| (Arc::clone(session), status)),
            }
        }

        let session = Session::new(
            payload,
            Arc::clone(&self.config),
            Arc::downgrade(self),
            Arc::clone(&self.factory),
        );
        sessions.insert(id, Arc::clone(&session));
        drop(sessions);

        if let Some(secs) = self.config.abort_after_secs {
            session.spawn_abort_timer(Duration::from_secs(secs));
        }
        Ok((session, JoinStatus::Created))
    }

    /// Drop `session` from the map unless another session took its id
    pub(crate) fn remove(&self, session: &Session) {
        let mut sessions = self.sessions.lock();
        let current = sessions
            .get(session.id())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if current {
            sessions.remove(session.id());
            debug!(id = %session.id(), remaining = sessions.len(), "Session removed from registry");
        }
    }

    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub(crate) fn add_ssrc(&self, ssrc: u32, entry: SsrcEntry) {
        self.ssrcs.insert(ssrc, entry);
    }

    pub(crate) fn remove_ssrcs(&self, ssrcs: &[u32]) {
        for ssrc in ssrcs {
            self.ssrcs.remove(ssrc);
        }
    }

    #[must_use]
    pub fn lookup_ssrc(&self, ssrc: u32) -> Option<SsrcEntry> {
        self.ssrcs.get(&ssrc).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        RegistryStats {
            sessions: sessions.len(),
            running: sessions
                .iter()
                .filter(|s| s.state() == SessionState::Running)
                .count(),
            connected_peers: sessions.iter().map(|s| s.connected_count()).sum(),
            ssrcs: self.ssrcs.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pipeline::PassthroughFactory;

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(SfuConfig::default(), Arc::new(PassthroughFactory))
    }

    fn payload(origin: &str, name: &str, user: &str, size: usize) -> JoinPayload {
        let mut payload = JoinPayload {
            interaction_name: name.to_string(),
            user_id: user.to_string(),
            size,
            ..Default::default()
        };
        payload.normalize(origin, &SfuConfig::default());
        payload
    }

    #[tokio::test]
    async fn test_join_until_full() {
        let registry = registry();
        let (first, status) = registry.join(&payload("o", "room", "a", 2)).unwrap();
        assert_eq!(status, JoinStatus::Created);

        // size of later joins is ignored
        let (second, status) = registry.join(&payload("o", "room", "b", 5)).unwrap();
        assert_eq!(status, JoinStatus::Joined);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.size(), 2);

        let err = registry.join(&payload("o", "room", "c", 2)).unwrap_err();
        assert!(matches!(err, Error::Full));
        assert_eq!(err.code(), "full");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_reconnect() {
        let registry = registry();
        let (session, _) = registry.join(&payload("o", "room", "a", 2)).unwrap();
        registry.join(&payload("o", "room", "b", 2)).unwrap();

        let err = registry.join(&payload("o", "room", "a", 2)).unwrap_err();
        assert_eq!(err.code(), "duplicate");

        let a = UserId::from("a");
        session.disconnect_user(&a);
        assert!(!session.is_connected(&a));

        let (_, status) = registry.join(&payload("o", "room", "a", 2)).unwrap();
        assert_eq!(status, JoinStatus::Reconnected);
        assert_eq!(session.joined_count(&a), 2);
        assert_eq!(session.file_prefix(&a), "default-room-a-2");

        // a reconnection does not count against the size
        assert!(matches!(
            registry.join(&payload("o", "room", "c", 2)),
            Err(Error::Full)
        ));
    }

    #[tokio::test]
    async fn test_sessions_are_scoped_by_origin() {
        let registry = registry();
        let (a, _) = registry.join(&payload("https://a.example", "room", "u", 2)).unwrap();
        let (b, status) = registry.join(&payload("https://b.example", "room", "u", 2)).unwrap();

        assert_eq!(status, JoinStatus::Created);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&SessionId::qualified("https://a.example", "room")).is_some());
    }

    #[tokio::test]
    async fn test_deleted_session_id_is_reused() {
        let registry = registry();
        let (old, _) = registry.join(&payload("o", "room", "a", 2)).unwrap();
        assert!(old.delete());
        assert!(!old.delete());
        assert!(registry.is_empty());

        let (fresh, status) = registry.join(&payload("o", "room", "a", 2)).unwrap();
        assert_eq!(status, JoinStatus::Created);
        assert!(!Arc::ptr_eq(&old, &fresh));

        // a stale delete must not evict the replacement
        registry.remove(&old);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_joins_share_a_session() {
        let registry = registry();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .join(&payload("o", "race", &format!("u{i}"), 4))
                        .map(|(_, status)| status)
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == JoinStatus::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_ssrc_index_and_stats() {
        let registry = registry();
        registry.join(&payload("o", "room", "a", 2)).unwrap();
        registry.add_ssrc(
            7,
            SsrcEntry {
                kind: TrackKind::Audio,
                namespace: "default".to_string(),
                session: "room".to_string(),
                user: UserId::from("a"),
            },
        );

        assert_eq!(registry.lookup_ssrc(7).map(|e| e.user), Some(UserId::from("a")));
        let stats = registry.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.connected_peers, 1);
        assert_eq!(stats.ssrcs, 1);

        registry.remove_ssrcs(&[7]);
        assert!(registry.lookup_ssrc(7).is_none());
    }
}
