//! Single-shot broadcast signal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A one-time event any number of tasks can wait on.
///
/// Cloning yields a handle to the same event. Firing more than once is a
/// no-op, and only the first caller observes `true` from [`Signal::fire`].
#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, returning whether this call did it
    pub fn fire(&self) -> bool {
        let first = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolve once the signal has fired
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}
