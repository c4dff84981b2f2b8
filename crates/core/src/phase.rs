//! Controller lifecycle phases.

use std::sync::Arc;

use tokio::sync::watch;

/// `Created -> Running -> Syncing -> Steady -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    Running,
    Syncing,
    Steady,
    Stopped,
}

/// Shared, forward-only phase cell. Observers subscribe via `watch`.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    tx: Arc<watch::Sender<Phase>>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Phase::Created);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Phase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.tx.subscribe()
    }

    /// Move to `next` if it is ahead of the current phase. Returns whether
    /// the phase changed.
    pub fn advance(&self, next: Phase) -> bool {
        self.tx.send_if_modified(|cur| {
            if next > *cur {
                *cur = next;
                true
            } else {
                false
            }
        })
    }
}
