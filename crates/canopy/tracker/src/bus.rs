//! Instance event bus

use canopy_types::InstanceEvent;
use tokio::sync::broadcast;

/// Broadcast bus for instance lifecycle events.
///
/// Subscribers that fall behind observe a lag error and skip ahead;
/// consumers are expected to log and resume.
#[derive(Clone)]
pub struct InstanceEventBus {
    tx: broadcast::Sender<InstanceEvent>,
}

impl InstanceEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn publish(&self, event: InstanceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.tx.subscribe()
    }
}

impl Default for InstanceEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
