//! Storage abstraction for the delivery engine.
//!
//! The engine talks to an [`EventStore`] trait so delivery logic, retry
//! policies, and error handling can be tested without a database. Production
//! wires [`PostgresEventStore`] over the repository layer; tests use the
//! in-memory double in [`memory`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{EventId, EventRecord, NewEvent},
    storage::events::ActivityCount,
    storage::Storage,
};

/// Storage operations required by the delivery engine.
///
/// Mirrors the abstract store contract: create, find, update (retry
/// scheduling and state transitions), delete, counts, group-by activity, and
/// paginated listing. All operations may fail with a persistence error;
/// callers decide whether to propagate or log-and-continue.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Creates a durable record, returning its store-assigned id.
    async fn create(&self, event: &NewEvent) -> Result<EventId>;

    /// Finds a record by id.
    async fn find(&self, id: EventId) -> Result<Option<EventRecord>>;

    /// Deletes a record, returning whether a row was removed.
    async fn delete(&self, id: EventId) -> Result<bool>;

    /// Persists retry bookkeeping and returns the record to `pending`.
    async fn schedule_retry(
        &self,
        id: EventId,
        retry_count: i32,
        last_error: &str,
        last_retry_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns an `enqueued` record to `pending` with the given due time.
    async fn release_to_pending(&self, id: EventId, due_at: DateTime<Utc>) -> Result<()>;

    /// Quarantines a record, preserving its original type and payload.
    async fn mark_dead_letter(
        &self,
        id: EventId,
        error: &str,
        moved_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomically claims records due for (re-)enqueue.
    async fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<EventRecord>>;

    /// Counts live (non-dead-letter) records.
    async fn count_live(&self) -> Result<i64>;

    /// Counts dead-letter records.
    async fn count_dead_letter(&self) -> Result<i64>;

    /// Counts live records created before the cutoff.
    async fn count_live_older_than(&self, cutoff: DateTime<Utc>) -> Result<i64>;

    /// Lists dead-letter records, newest quarantine first.
    async fn list_dead_letters(&self, offset: i64, limit: i64) -> Result<Vec<EventRecord>>;

    /// Fetches the oldest dead-letter records for reprocessing.
    async fn oldest_dead_letters(&self, limit: i64) -> Result<Vec<EventRecord>>;

    /// Counts records created since the cutoff, grouped by type and status.
    async fn activity_by_type(&self, since: DateTime<Utc>) -> Result<Vec<ActivityCount>>;

    /// Releases stale `enqueued` records back to `pending`.
    async fn release_orphans(&self, cutoff: DateTime<Utc>, due_at: DateTime<Utc>) -> Result<u64>;

    /// Deletes dead-letter records quarantined before the cutoff.
    async fn purge_dead_letters_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Production store implementation delegating to the PostgreSQL repository.
pub struct PostgresEventStore {
    storage: Arc<Storage>,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    async fn create(&self, event: &NewEvent) -> Result<EventId> {
        self.storage.events.create(event).await
    }

    async fn find(&self, id: EventId) -> Result<Option<EventRecord>> {
        self.storage.events.find_by_id(id).await
    }

    async fn delete(&self, id: EventId) -> Result<bool> {
        self.storage.events.delete(id).await
    }

    async fn schedule_retry(
        &self,
        id: EventId,
        retry_count: i32,
        last_error: &str,
        last_retry_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.storage
            .events
            .schedule_retry(id, retry_count, last_error, last_retry_at, next_attempt_at)
            .await
    }

    async fn release_to_pending(&self, id: EventId, due_at: DateTime<Utc>) -> Result<()> {
        self.storage.events.release_to_pending(id, due_at).await
    }

    async fn mark_dead_letter(
        &self,
        id: EventId,
        error: &str,
        moved_at: DateTime<Utc>,
    ) -> Result<()> {
        self.storage.events.mark_dead_letter(id, error, moved_at).await
    }

    async fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        self.storage.events.claim_due(batch_size, now).await
    }

    async fn count_live(&self) -> Result<i64> {
        self.storage.events.count_live().await
    }

    async fn count_dead_letter(&self) -> Result<i64> {
        self.storage.events.count_dead_letter().await
    }

    async fn count_live_older_than(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        self.storage.events.count_live_older_than(cutoff).await
    }

    async fn list_dead_letters(&self, offset: i64, limit: i64) -> Result<Vec<EventRecord>> {
        self.storage.events.list_dead_letters(offset, limit).await
    }

    async fn oldest_dead_letters(&self, limit: i64) -> Result<Vec<EventRecord>> {
        self.storage.events.oldest_dead_letters(limit).await
    }

    async fn activity_by_type(&self, since: DateTime<Utc>) -> Result<Vec<ActivityCount>> {
        self.storage.events.activity_by_type(since).await
    }

    async fn release_orphans(&self, cutoff: DateTime<Utc>, due_at: DateTime<Utc>) -> Result<u64> {
        self.storage.events.release_orphans(cutoff, due_at).await
    }

    async fn purge_dead_letters_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.storage.events.purge_dead_letters_before(cutoff).await
    }
}

pub mod memory {
    //! In-memory store for testing delivery logic without a database.
    //!
    //! Behavior matches the SQL repository's state transitions. Failures can
    //! be injected per operation to exercise the best-effort bookkeeping
    //! paths.

    use std::{
        collections::HashMap,
        sync::atomic::{AtomicI64, Ordering},
    };

    use courier_core::{error::CoreError, models::EventStatus};
    use tokio::sync::RwLock;

    use super::*;

    /// In-memory event store with injectable failures.
    #[derive(Default)]
    pub struct InMemoryEventStore {
        records: RwLock<HashMap<EventId, EventRecord>>,
        next_id: AtomicI64,
        fail_create: RwLock<Option<String>>,
        fail_schedule_retry: RwLock<Option<String>>,
        fail_delete: RwLock<Option<String>>,
    }

    impl InMemoryEventStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self { next_id: AtomicI64::new(1), ..Self::default() }
        }

        /// Fails the next `create` call with the given message.
        pub async fn inject_create_error(&self, message: impl Into<String>) {
            *self.fail_create.write().await = Some(message.into());
        }

        /// Fails the next `schedule_retry` call with the given message.
        pub async fn inject_schedule_retry_error(&self, message: impl Into<String>) {
            *self.fail_schedule_retry.write().await = Some(message.into());
        }

        /// Fails the next `delete` call with the given message.
        pub async fn inject_delete_error(&self, message: impl Into<String>) {
            *self.fail_delete.write().await = Some(message.into());
        }

        /// Returns a snapshot of a record for verification.
        pub async fn snapshot(&self, id: EventId) -> Option<EventRecord> {
            self.records.read().await.get(&id).cloned()
        }

        /// Total number of records currently stored.
        pub async fn len(&self) -> usize {
            self.records.read().await.len()
        }

        /// Whether the store holds no records.
        pub async fn is_empty(&self) -> bool {
            self.records.read().await.is_empty()
        }

        async fn take_failure(slot: &RwLock<Option<String>>) -> Option<CoreError> {
            slot.write().await.take().map(CoreError::Database)
        }
    }

    #[async_trait::async_trait]
    impl EventStore for InMemoryEventStore {
        async fn create(&self, event: &NewEvent) -> Result<EventId> {
            if let Some(err) = Self::take_failure(&self.fail_create).await {
                return Err(err);
            }

            let id = EventId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let record = EventRecord {
                id,
                event_type: event.event_type,
                payload: event.payload.clone(),
                status: event.status,
                retry_count: 0,
                max_retries: event.max_retries,
                priority: event.priority,
                last_error: None,
                last_retry_at: None,
                next_attempt_at: event.next_attempt_at,
                dead_lettered_at: None,
                created_at: event.created_at,
                updated_at: event.created_at,
            };

            self.records.write().await.insert(id, record);
            Ok(id)
        }

        async fn find(&self, id: EventId) -> Result<Option<EventRecord>> {
            Ok(self.records.read().await.get(&id).cloned())
        }

        async fn delete(&self, id: EventId) -> Result<bool> {
            if let Some(err) = Self::take_failure(&self.fail_delete).await {
                return Err(err);
            }

            Ok(self.records.write().await.remove(&id).is_some())
        }

        async fn schedule_retry(
            &self,
            id: EventId,
            retry_count: i32,
            last_error: &str,
            last_retry_at: DateTime<Utc>,
            next_attempt_at: DateTime<Utc>,
        ) -> Result<()> {
            if let Some(err) = Self::take_failure(&self.fail_schedule_retry).await {
                return Err(err);
            }

            if let Some(record) = self.records.write().await.get_mut(&id) {
                record.status = EventStatus::Pending;
                record.retry_count = retry_count;
                record.last_error = Some(last_error.to_string());
                record.last_retry_at = Some(last_retry_at);
                record.next_attempt_at = Some(next_attempt_at);
                record.updated_at = last_retry_at;
            }
            Ok(())
        }

        async fn release_to_pending(&self, id: EventId, due_at: DateTime<Utc>) -> Result<()> {
            if let Some(record) = self.records.write().await.get_mut(&id) {
                if record.status == EventStatus::Enqueued {
                    record.status = EventStatus::Pending;
                    record.next_attempt_at = Some(due_at);
                    record.updated_at = due_at;
                }
            }
            Ok(())
        }

        async fn mark_dead_letter(
            &self,
            id: EventId,
            error: &str,
            moved_at: DateTime<Utc>,
        ) -> Result<()> {
            if let Some(record) = self.records.write().await.get_mut(&id) {
                record.status = EventStatus::DeadLetter;
                record.last_error = Some(error.to_string());
                record.dead_lettered_at = Some(moved_at);
                record.next_attempt_at = None;
                record.updated_at = moved_at;
            }
            Ok(())
        }

        async fn claim_due(
            &self,
            batch_size: usize,
            now: DateTime<Utc>,
        ) -> Result<Vec<EventRecord>> {
            let mut records = self.records.write().await;

            let mut due: Vec<EventId> = records
                .values()
                .filter(|r| {
                    r.status == EventStatus::Pending
                        && r.next_attempt_at.is_some_and(|at| at <= now)
                })
                .map(|r| r.id)
                .collect();
            due.sort();
            due.truncate(batch_size);

            let mut claimed = Vec::with_capacity(due.len());
            for id in due {
                if let Some(record) = records.get_mut(&id) {
                    record.status = EventStatus::Enqueued;
                    record.next_attempt_at = None;
                    record.updated_at = now;
                    claimed.push(record.clone());
                }
            }

            Ok(claimed)
        }

        async fn count_live(&self) -> Result<i64> {
            let records = self.records.read().await;
            Ok(records.values().filter(|r| !r.is_dead_letter()).count() as i64)
        }

        async fn count_dead_letter(&self) -> Result<i64> {
            let records = self.records.read().await;
            Ok(records.values().filter(|r| r.is_dead_letter()).count() as i64)
        }

        async fn count_live_older_than(&self, cutoff: DateTime<Utc>) -> Result<i64> {
            let records = self.records.read().await;
            Ok(records
                .values()
                .filter(|r| !r.is_dead_letter() && r.created_at < cutoff)
                .count() as i64)
        }

        async fn list_dead_letters(&self, offset: i64, limit: i64) -> Result<Vec<EventRecord>> {
            let records = self.records.read().await;
            let mut dead: Vec<EventRecord> =
                records.values().filter(|r| r.is_dead_letter()).cloned().collect();
            dead.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));

            Ok(dead
                .into_iter()
                .skip(usize::try_from(offset).unwrap_or(0))
                .take(usize::try_from(limit).unwrap_or(0))
                .collect())
        }

        async fn oldest_dead_letters(&self, limit: i64) -> Result<Vec<EventRecord>> {
            let records = self.records.read().await;
            let mut dead: Vec<EventRecord> =
                records.values().filter(|r| r.is_dead_letter()).cloned().collect();
            dead.sort_by(|a, b| a.dead_lettered_at.cmp(&b.dead_lettered_at));
            dead.truncate(usize::try_from(limit).unwrap_or(0));

            Ok(dead)
        }

        async fn activity_by_type(&self, since: DateTime<Utc>) -> Result<Vec<ActivityCount>> {
            let records = self.records.read().await;
            let mut buckets: HashMap<(String, String), i64> = HashMap::new();

            for record in records.values().filter(|r| r.created_at >= since) {
                let key =
                    (record.event_type.to_string(), record.status.to_string());
                *buckets.entry(key).or_insert(0) += 1;
            }

            let mut rows: Vec<ActivityCount> = buckets
                .into_iter()
                .map(|((event_type, status), count)| ActivityCount { event_type, status, count })
                .collect();
            rows.sort_by(|a, b| a.event_type.cmp(&b.event_type));

            Ok(rows)
        }

        async fn release_orphans(
            &self,
            cutoff: DateTime<Utc>,
            due_at: DateTime<Utc>,
        ) -> Result<u64> {
            let mut records = self.records.write().await;
            let mut released = 0;

            for record in records.values_mut() {
                if record.status == EventStatus::Enqueued && record.updated_at < cutoff {
                    record.status = EventStatus::Pending;
                    record.next_attempt_at = Some(due_at);
                    record.updated_at = due_at;
                    released += 1;
                }
            }

            Ok(released)
        }

        async fn purge_dead_letters_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, r| {
                !(r.is_dead_letter() && r.dead_lettered_at.is_some_and(|at| at < cutoff))
            });

            Ok((before - records.len()) as u64)
        }
    }

    #[cfg(test)]
    mod tests {
        use courier_core::{EventType, Priority};

        use super::*;

        fn new_event(status: EventStatus, next_attempt_at: Option<DateTime<Utc>>) -> NewEvent {
            NewEvent {
                event_type: EventType::CampaignPublished,
                payload: serde_json::json!({"campaignId": "c-1"}),
                status,
                max_retries: 3,
                priority: Priority::Normal,
                next_attempt_at,
                created_at: Utc::now(),
            }
        }

        #[tokio::test]
        async fn ids_are_monotonically_increasing() {
            let store = InMemoryEventStore::new();
            let first = store.create(&new_event(EventStatus::Enqueued, None)).await.unwrap();
            let second = store.create(&new_event(EventStatus::Enqueued, None)).await.unwrap();

            assert!(second > first);
        }

        #[tokio::test]
        async fn claim_due_skips_future_and_enqueued_records() {
            let store = InMemoryEventStore::new();
            let now = Utc::now();

            let due = store
                .create(&new_event(EventStatus::Pending, Some(now - chrono::Duration::seconds(1))))
                .await
                .unwrap();
            store
                .create(&new_event(EventStatus::Pending, Some(now + chrono::Duration::hours(1))))
                .await
                .unwrap();
            store.create(&new_event(EventStatus::Enqueued, None)).await.unwrap();

            let claimed = store.claim_due(10, now).await.unwrap();
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].id, due);
            assert_eq!(claimed[0].status, EventStatus::Enqueued);
        }

        #[tokio::test]
        async fn injected_failures_surface_once() {
            let store = InMemoryEventStore::new();
            store.inject_create_error("disk full").await;

            assert!(store.create(&new_event(EventStatus::Enqueued, None)).await.is_err());
            assert!(store.create(&new_event(EventStatus::Enqueued, None)).await.is_ok());
        }
    }
}
