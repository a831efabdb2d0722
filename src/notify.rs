use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, InstanceId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for state changes, one channel per session instance.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<InstanceId, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes on an instance. Creates the channel if needed.
    pub fn subscribe(&self, instance_id: InstanceId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(instance_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, instance_id: InstanceId, event: &Event) {
        if let Some(sender) = self.channels.get(&instance_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose last watcher has gone away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}
