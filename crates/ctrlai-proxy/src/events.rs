//! Audit-event fan-out for live subscribers (the dashboard feed).
//!
//! One broadcast channel with a bounded per-receiver queue; a subscriber
//! that stops draining lags and loses events rather than slowing the
//! proxy. The request path never blocks on a subscriber.

use ctrlai_audit::AuditEntry;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Bounded fan-out of audit entries.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<AuditEntry>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        EventBroadcaster { sender }
    }

    /// Subscribe to entries published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.sender.subscribe()
    }

    /// Publish an entry to all current subscribers. With no subscribers
    /// this is a no-op.
    pub fn publish(&self, entry: AuditEntry) {
        let _ = self.sender.send(entry);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
