use super::types::EngineEvent;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

/// Fire-and-forget publisher for engine domain events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: EngineEvent,
    pub published_at: DateTime<Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: EngineEvent) {
        let name = event.name();
        let run_id = event.run_id();
        let published = PublishedEvent {
            event,
            published_at: Utc::now(),
        };

        // No subscribers is fine; events are best effort.
        if self.sender.send(published).is_err() {
            trace!(event = name, run_id = %run_id, "Event published with no subscribers");
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(8);
        publisher.publish(EngineEvent::RunCancelled {
            run_id: Uuid::now_v7(),
            reason: None,
            completed_at: Utc::now(),
        });
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let publisher = EventPublisher::new(8);
        let mut receiver = publisher.subscribe();
        let run_id = Uuid::now_v7();
        publisher.publish(EngineEvent::RunMetadataUpdated {
            run_id,
            metadata: serde_json::json!({"progress": 1}),
        });

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event.run_id(), run_id);
        assert_eq!(received.event.name(), "runMetadataUpdated");
    }
}
