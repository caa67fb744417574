//! In-process topic-based publish/subscribe.
//!
//! Handlers run on their own tokio task, never on the publisher's. Per-
//! subscriber queueing is bounded by the channel capacity; a subscriber that
//! falls behind loses the oldest events first, and the loss is counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::events::{topic_matches, Event};

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes an event to all current subscribers. No subscribers is fine.
    pub fn publish(&self, event: Event) {
        log::debug!("event published: {} ({})", event.topic(), event.id);
        let _ = self.sender.send(event);
    }

    /// Raw subscription receiving every event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Registers a handler for events whose topic matches `pattern` and runs
    /// it on a dedicated task. Dropped events (subscriber lag) are counted
    /// and logged, not redelivered.
    pub fn subscribe_handler<F>(&self, pattern: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(Event) + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();
        let dropped = Arc::clone(&self.dropped);

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if topic_matches(&pattern, event.topic()) {
                            handler(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        dropped.fetch_add(n, Ordering::Relaxed);
                        log::warn!("event subscriber lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Total events dropped because subscribers lagged.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn event(event_type: EventType) -> Event {
        Event::new(event_type, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_handler_receives_matching_topics() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe_handler("processing.*", move |event| {
            let _ = tx.send(event.event_type);
        });
        // Give the subscriber task a beat to register.
        tokio::task::yield_now().await;

        bus.publish(event(EventType::ProcessingStarted));
        bus.publish(event(EventType::InspectionCreated));
        bus.publish(event(EventType::ProcessingCompleted));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first, EventType::ProcessingStarted);
        assert_eq!(second, EventType::ProcessingCompleted);
        // The inspection event never arrives.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(event(EventType::Test));
        assert_eq!(bus.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();

        for _ in 0..5 {
            bus.publish(event(EventType::Test));
        }

        // The first recv reports the lag; subsequent events still flow.
        match receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {:?}", other.map(|e| e.id)),
        }
        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_counter_via_handler() {
        let bus = EventBus::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // A handler that blocks on the first event so the channel overflows.
        let handle = bus.subscribe_handler("*", move |event| {
            let _ = tx.send(event.id);
            std::thread::sleep(Duration::from_millis(50));
        });
        tokio::task::yield_now().await;

        for _ in 0..8 {
            bus.publish(event(EventType::Test));
        }

        // Wait for the handler to work through what survived.
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(bus.dropped_events() > 0);
        handle.abort();
    }
}
