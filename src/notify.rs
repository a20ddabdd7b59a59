use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per organizer. Every committed event
/// is fanned out to subscribers of that organizer's channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for an organizer. Creates the channel if needed.
    #[allow(dead_code)]
    pub fn subscribe(&self, organizer_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(organizer_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, organizer_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&organizer_id) {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let org = Ulid::new();
        let mut rx = hub.subscribe(org);

        let event = Event::BookingCancelled {
            id: Ulid::new(),
            organizer_id: org,
        };
        hub.send(org, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let org = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            org,
            &Event::BookingCancelled {
                id: Ulid::new(),
                organizer_id: org,
            },
        );
    }
}
