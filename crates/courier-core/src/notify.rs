//! In-process publish notifications.
//!
//! Lets same-process observers react to publications without touching the
//! durable path. Notifications are fire-and-forget: there is no delivery
//! guarantee and listener failures never propagate back to the publisher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EventId, EventType};

/// Notification emitted when an event is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishNotice {
    /// Durable record created for the publication.
    pub event_id: EventId,

    /// Domain event kind.
    pub event_type: EventType,

    /// Opaque domain payload.
    pub payload: serde_json::Value,

    /// When the publication happened.
    pub published_at: DateTime<Utc>,
}

/// Trait for same-process publish observers.
///
/// Implementations must not block publication. Failures should be logged by
/// the listener itself; nothing is retried or reported upstream.
#[async_trait::async_trait]
pub trait PublishListener: Send + Sync + std::fmt::Debug {
    /// Handles a publish notification.
    async fn notify(&self, notice: PublishNotice);
}

/// No-op listener that discards all notifications.
#[derive(Debug, Default)]
pub struct NoOpListener;

impl NoOpListener {
    /// Creates a new no-op listener.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl PublishListener for NoOpListener {
    async fn notify(&self, _notice: PublishNotice) {}
}

/// Multicast listener that forwards notifications to all subscribers.
///
/// Subscribers receive every notification concurrently; the publisher does
/// not know about individual subscribers.
#[derive(Debug, Clone, Default)]
pub struct MulticastListener {
    listeners: Vec<Arc<dyn PublishListener>>,
}

impl MulticastListener {
    /// Creates a multicast listener with no subscribers.
    pub fn new() -> Self {
        Self { listeners: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, listener: Arc<dyn PublishListener>) {
        self.listeners.push(listener);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait::async_trait]
impl PublishListener for MulticastListener {
    async fn notify(&self, notice: PublishNotice) {
        let futures = self.listeners.iter().map(|listener| {
            let notice = notice.clone();
            async move {
                listener.notify(notice).await;
            }
        });

        // Listener outcomes never interfere with publication
        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingListener {
        seen: Arc<AtomicUsize>,
    }

    impl CountingListener {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let counter = Arc::new(AtomicUsize::new(0));
            (Self { seen: counter.clone() }, counter)
        }
    }

    #[async_trait::async_trait]
    impl PublishListener for CountingListener {
        async fn notify(&self, _notice: PublishNotice) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample_notice() -> PublishNotice {
        PublishNotice {
            event_id: EventId(1),
            event_type: EventType::CampaignPublished,
            payload: serde_json::json!({"campaignId": "c-1"}),
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn no_op_listener_discards_notices() {
        NoOpListener::new().notify(sample_notice()).await;
    }

    #[tokio::test]
    async fn multicast_forwards_to_all_subscribers() {
        let mut multicast = MulticastListener::new();
        let (first, first_count) = CountingListener::new();
        let (second, second_count) = CountingListener::new();

        multicast.add_subscriber(Arc::new(first));
        multicast.add_subscriber(Arc::new(second));
        assert_eq!(multicast.subscriber_count(), 2);

        multicast.notify(sample_notice()).await;

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multicast_tolerates_zero_subscribers() {
        MulticastListener::new().notify(sample_notice()).await;
    }
}
