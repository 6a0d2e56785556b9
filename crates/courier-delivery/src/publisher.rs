//! Event publication: durable record, local notification, broker enqueue.
//!
//! `publish` is the producer-facing entry point. Failures are logged and
//! surface through the returned `Result`; nothing is retried at the publish
//! boundary itself. A record whose broker enqueue failed stays `enqueued`
//! and is reconciled by the recovery pass.

use std::{sync::Arc, time::Duration};

use courier_core::{
    Clock, EventId, EventStatus, EventType, MulticastListener, NewEvent, Priority, PublishListener,
    PublishNotice, QueueMessage,
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    broker::Broker,
    error::{DeliveryError, Result},
    store::EventStore,
    DEFAULT_MAX_RETRIES,
};

/// Options for a single publication.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Retry budget for the event.
    pub max_retries: u32,

    /// Delivery priority.
    pub priority: Priority,

    /// Delay before the first delivery attempt. Delayed publishes are
    /// enqueued by the retry sweeper when due, so they survive restarts.
    pub delay: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES, priority: Priority::Normal, delay: Duration::ZERO }
    }
}

/// Publishes domain events into the delivery pipeline.
pub struct Publisher {
    store: Arc<dyn EventStore>,
    broker: Arc<dyn Broker>,
    listeners: Arc<MulticastListener>,
    clock: Arc<dyn Clock>,
    queue: String,
}

impl Publisher {
    /// Creates a publisher targeting the given queue.
    pub fn new(
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
        listeners: Arc<MulticastListener>,
        clock: Arc<dyn Clock>,
        queue: impl Into<String>,
    ) -> Self {
        Self { store, broker, listeners, clock, queue: queue.into() }
    }

    /// Publishes an event with default options.
    ///
    /// # Errors
    ///
    /// Returns error if the durable record or the broker enqueue fails;
    /// callers must check the result.
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<EventId> {
        self.publish_with(event_type, payload, PublishOptions::default()).await
    }

    /// Publishes an event with explicit options.
    ///
    /// Creates exactly one durable record and enqueues exactly one broker
    /// message referencing it (immediately, or via the sweeper when
    /// delayed). The in-process notification is fire-and-forget and carries
    /// no delivery guarantee.
    ///
    /// # Errors
    ///
    /// Returns error if the durable record or the broker enqueue fails.
    pub async fn publish_with(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<EventId> {
        let now = self.clock.now();
        let delayed = !options.delay.is_zero();

        let new_event = NewEvent {
            event_type,
            payload: payload.clone(),
            status: if delayed { EventStatus::Pending } else { EventStatus::Enqueued },
            max_retries: i32::try_from(options.max_retries).unwrap_or(i32::MAX),
            priority: options.priority,
            next_attempt_at: delayed
                .then(|| now + chrono::Duration::from_std(options.delay).unwrap_or_default()),
            created_at: now,
        };

        let event_id = self.store.create(&new_event).await.map_err(|e| {
            error!(event_type = %event_type, error = %e, "failed to persist event record");
            DeliveryError::from(e)
        })?;

        self.notify_listeners(event_id, event_type, payload.clone(), now);

        if !delayed {
            let message = QueueMessage {
                message_id: Uuid::new_v4(),
                event_id,
                event_type,
                payload,
                attempt: 1,
                priority: options.priority,
            };

            self.broker.publish(&self.queue, &message).await.map_err(|e| {
                // Record stays enqueued; the recovery pass releases it
                error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    error = %e,
                    "failed to enqueue broker message"
                );
                e
            })?;
        }

        debug!(
            event_id = %event_id,
            event_type = %event_type,
            priority = %options.priority,
            delayed,
            "event published"
        );

        Ok(event_id)
    }

    fn notify_listeners(
        &self,
        event_id: EventId,
        event_type: EventType,
        payload: serde_json::Value,
        published_at: chrono::DateTime<chrono::Utc>,
    ) {
        if self.listeners.subscriber_count() == 0 {
            return;
        }

        let listeners = self.listeners.clone();
        let notice = PublishNotice { event_id, event_type, payload, published_at };
        tokio::spawn(async move {
            listeners.notify(notice).await;
        });
    }
}
