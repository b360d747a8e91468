use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::ResvEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for reservation events, keyed by reservation name. The
/// node fan-out layer subscribes here to learn when a reservation it
/// pushed to compute nodes changed shape.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<ResvEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a reservation. Creates the channel if needed.
    pub fn subscribe(&self, resv_name: &str) -> broadcast::Receiver<ResvEvent> {
        let sender = self
            .channels
            .entry(resv_name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, event: &ResvEvent) {
        if let Some(sender) = self.channels.get(event.resv_name()) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel once its reservation is gone for good.
    pub fn remove(&self, resv_name: &str) {
        self.channels.remove(resv_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("maint_week");

        let event = ResvEvent::Created {
            name: "maint_week".into(),
            resv_id: 3,
        };
        hub.send(&event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send(&ResvEvent::Deleted {
            name: "gone".into(),
        });
    }
}
