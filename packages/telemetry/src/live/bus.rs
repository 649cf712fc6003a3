// packages/telemetry/src/live/bus.rs
//! In-process fan-out of captured events
//!
//! Every captured event is published here whether or not the push channel
//! is connected. Subscribers that fall more than `capacity` events behind
//! see `RecvError::Lagged` and skip ahead.

use crate::capture::event::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Local publish/subscribe bus
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Hand an event to every current subscriber; returns how many got it
    pub fn publish(&self, event: Event) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is the normal case when no dashboard is open.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_event;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(test_event("evt_1")), 0);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.publish(test_event("evt_1")), 2);
        assert_eq!(a.recv().await.unwrap().id(), "evt_1");
        assert_eq!(b.recv().await.unwrap().id(), "evt_1");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(test_event(&format!("evt_{}", i)));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().id(), "evt_3");
    }
}
