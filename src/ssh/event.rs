use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One-shot event: starts unset, can be set exactly once, and any number of
/// waiters observe it. Clones share the same event.
#[derive(Debug, Clone)]
pub struct OneShotEvent {
    tx: Arc<watch::Sender<bool>>,
}

impl OneShotEvent {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the event. Returns `true` only for the call that actually fired it.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the event is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Wait at most `limit`. Returns whether the event was set in time.
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait()).await.is_ok()
    }
}

impl Default for OneShotEvent {
    fn default() -> Self {
        Self::new()
    }
}
