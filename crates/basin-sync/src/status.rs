//! Shared, observable [`SyncStatus`].
//!
//! The streaming client and the upload queue both write to one status; UI
//! code subscribes to a `watch` receiver and sees every change.

use std::sync::Arc;

use tokio::sync::watch;

use basin_core::SyncStatus;

#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl StatusPublisher {
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        StatusPublisher { tx: Arc::new(tx) }
    }

    /// Applies `f` and notifies subscribers if anything changed.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(SyncStatus::default())
    }
}
