//! Per-session logging context

use std::fmt;
use std::sync::OnceLock;
use tokio::time::Instant;
use tracing::{info_span, Span};

use crate::types::{TrackKind, UserId};

/// Span and clocks shared by everything a session owns.
///
/// Passed to sessions, mixers and slices at construction so every log line
/// they emit carries the namespace, the session name and elapsed times.
#[derive(Debug)]
pub struct LogContext {
    span: Span,
    created_at: Instant,
    started_at: OnceLock<Instant>,
}

impl LogContext {
    #[must_use]
    pub fn new(namespace: &str, session: &str) -> Self {
        Self {
            span: info_span!("session", namespace = %namespace, session = %session),
            created_at: Instant::now(),
            started_at: OnceLock::new(),
        }
    }

    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Span for work done on behalf of one participant
    #[must_use]
    pub fn user_span(&self, user: &UserId) -> Span {
        info_span!(parent: &self.span, "peer", user = %user)
    }

    /// Span for the processing of one inbound track
    #[must_use]
    pub fn track_span(&self, user: &UserId, kind: TrackKind) -> Span {
        info_span!(parent: &self.span, "track", user = %user, kind = %kind)
    }

    /// Record the start instant; only the first call counts
    pub fn mark_started(&self) -> Instant {
        *self.started_at.get_or_init(Instant::now)
    }

    #[must_use]
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    /// Elapsed times, formatted as `since_creation=...ms since_start=...ms`
    #[must_use]
    pub fn elapsed(&self) -> Elapsed {
        let now = Instant::now();
        Elapsed {
            since_creation_ms: now.duration_since(self.created_at).as_millis(),
            since_start_ms: self
                .started_at
                .get()
                .map(|started| now.duration_since(*started).as_millis()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub since_creation_ms: u128,
    pub since_start_ms: Option<u128>,
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "since_creation={}ms", self.since_creation_ms)?;
        if let Some(since_start) = self.since_start_ms {
            write!(f, " since_start={since_start}ms")?;
        }
        Ok(())
    }
}
