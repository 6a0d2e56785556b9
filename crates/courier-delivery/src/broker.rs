//! Broker abstraction for queue publish/subscribe.
//!
//! The delivery core only consumes this seam; competing-consumers semantics
//! (each message handed to exactly one subscriber) are the broker backend's
//! guarantee. [`InMemoryBroker`] is the single-process backend used by the
//! service binary and by tests; external queue backends plug in behind the
//! same trait.

use std::collections::HashMap;

use courier_core::QueueMessage;
use tokio::sync::{mpsc, Mutex};

use crate::error::{DeliveryError, Result};

/// Queue channel capacity of the in-memory backend.
const QUEUE_CAPACITY: usize = 1024;

/// Publish/subscribe primitives over a message queue.
///
/// Messages travel as raw JSON values; consumers decode defensively because
/// producers on other stacks may string-encode the body.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Enqueues a message on the named queue.
    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<()>;

    /// Subscribes to the named queue, returning the message stream.
    ///
    /// Dropping the receiver cancels the subscription.
    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<serde_json::Value>>;
}

struct QueueSlot {
    sender: mpsc::Sender<serde_json::Value>,
    receiver: Option<mpsc::Receiver<serde_json::Value>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        Self { sender, receiver: Some(receiver) }
    }
}

/// In-process broker backed by bounded tokio channels.
///
/// One subscriber per queue; within a process that subscriber is the
/// consumer worker loop. Messages published before the subscription are
/// buffered up to the queue capacity.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueSlot>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a raw wire value, bypassing message serialization.
    ///
    /// Lets tests exercise the consumer's defensive decoding with malformed
    /// or string-encoded bodies.
    pub async fn publish_raw(&self, queue: &str, value: serde_json::Value) -> Result<()> {
        let sender = {
            let mut queues = self.queues.lock().await;
            queues.entry(queue.to_string()).or_insert_with(QueueSlot::new).sender.clone()
        };

        sender
            .send(value)
            .await
            .map_err(|_| DeliveryError::queue(format!("queue '{queue}' is closed")))
    }

    /// Number of messages currently buffered on the queue.
    pub async fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, |slot| QUEUE_CAPACITY - slot.sender.capacity())
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<()> {
        let value = serde_json::to_value(message)
            .map_err(|e| DeliveryError::queue(format!("message serialization failed: {e}")))?;
        self.publish_raw(queue, value).await
    }

    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<serde_json::Value>> {
        let mut queues = self.queues.lock().await;
        let slot = queues.entry(queue.to_string()).or_insert_with(QueueSlot::new);

        slot.receiver
            .take()
            .ok_or_else(|| DeliveryError::queue(format!("queue '{queue}' already has a subscriber")))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{EventId, EventType, Priority};
    use uuid::Uuid;

    use super::*;

    fn message(event_id: i64) -> QueueMessage {
        QueueMessage {
            message_id: Uuid::new_v4(),
            event_id: EventId(event_id),
            event_type: EventType::CampaignPublished,
            payload: serde_json::json!({"campaignId": "c-1"}),
            attempt: 1,
            priority: Priority::Normal,
        }
    }

    #[tokio::test]
    async fn published_messages_reach_the_subscriber() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe("events").await.unwrap();

        broker.publish("events", &message(1)).await.unwrap();

        let wire = rx.recv().await.unwrap();
        assert_eq!(wire["eventId"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn messages_published_before_subscribe_are_buffered() {
        let broker = InMemoryBroker::new();
        broker.publish("events", &message(7)).await.unwrap();
        assert_eq!(broker.depth("events").await, 1);

        let mut rx = broker.subscribe("events").await.unwrap();
        let wire = rx.recv().await.unwrap();
        assert_eq!(wire["eventId"], serde_json::json!(7));
    }

    #[tokio::test]
    async fn second_subscriber_is_rejected() {
        let broker = InMemoryBroker::new();
        let _rx = broker.subscribe("events").await.unwrap();

        let err = broker.subscribe("events").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Queue { .. }));
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let broker = InMemoryBroker::new();
        let mut events_rx = broker.subscribe("events").await.unwrap();
        let mut other_rx = broker.subscribe("other").await.unwrap();

        broker.publish("events", &message(1)).await.unwrap();

        assert!(events_rx.recv().await.is_some());
        assert!(other_rx.try_recv().is_err());
    }
}
