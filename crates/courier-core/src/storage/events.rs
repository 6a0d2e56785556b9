//! Repository for durable event record operations.
//!
//! Handles creation, due-time claiming, retry scheduling, dead-letter
//! transitions, and the counting queries behind the monitoring surface.
//! Concurrent updates to the same record are serialized at the storage
//! layer via atomic update-by-id and `FOR UPDATE SKIP LOCKED` claims.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EventId, EventRecord, NewEvent},
};

const RECORD_COLUMNS: &str = "id, event_type, payload, status, retry_count, max_retries, \
     priority, last_error, last_retry_at, next_attempt_at, dead_lettered_at, \
     created_at, updated_at";

/// Per-event-type activity counts within a time window.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ActivityCount {
    /// Domain event kind tag.
    pub event_type: String,
    /// Lifecycle state tag.
    pub status: String,
    /// Number of records in this (type, status) bucket.
    pub count: i64,
}

/// Repository for event record database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates a new event record, returning its store-assigned id.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, event: &NewEvent) -> Result<EventId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO event_records (
                event_type, payload, status, retry_count, max_retries,
                priority, next_attempt_at, created_at, updated_at
            ) VALUES ($1, $2, $3, 0, $4, $5, $6, $7, $7)
            RETURNING id
            "#,
        )
        .bind(event.event_type)
        .bind(&event.payload)
        .bind(event.status)
        .bind(event.max_retries)
        .bind(event.priority)
        .bind(event.next_attempt_at)
        .bind(event.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(EventId(id))
    }

    /// Finds a record by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<EventRecord>> {
        let record = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM event_records WHERE id = $1",
        ))
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Claims records due for (re-)enqueue.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent sweepers never claim the
    /// same record. Claimed records transition `pending -> enqueued`
    /// atomically; a crash before the broker publish leaves them `enqueued`
    /// for the recovery pass to release.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM event_records
            WHERE status = 'pending'
              AND next_attempt_at IS NOT NULL
              AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, EventRecord>(&format!(
            r#"
            UPDATE event_records
            SET status = 'enqueued', next_attempt_at = NULL, updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING {RECORD_COLUMNS}
            "#,
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(records)
    }

    /// Persists retry bookkeeping and returns the record to `pending`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        event_id: EventId,
        retry_count: i32,
        last_error: &str,
        last_retry_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_records
            SET status = 'pending',
                retry_count = $1,
                last_error = $2,
                last_retry_at = $3,
                next_attempt_at = $4,
                updated_at = NOW()
            WHERE id = $5
            "#,
        )
        .bind(retry_count)
        .bind(last_error)
        .bind(last_retry_at)
        .bind(next_attempt_at)
        .bind(event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns an `enqueued` record to `pending` without touching its retry
    /// bookkeeping. Used when a broker enqueue fails after a claim.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_to_pending(&self, event_id: EventId, due_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_records
            SET status = 'pending', next_attempt_at = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'enqueued'
            "#,
        )
        .bind(due_at)
        .bind(event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a record, returning whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, event_id: EventId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM event_records WHERE id = $1")
            .bind(event_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Quarantines a record, preserving its original type and payload.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_dead_letter(
        &self,
        event_id: EventId,
        error: &str,
        moved_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_records
            SET status = 'dead_letter',
                last_error = $1,
                dead_lettered_at = $2,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(error)
        .bind(moved_at)
        .bind(event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Counts live (non-dead-letter) records.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_live(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM event_records WHERE status <> 'dead_letter'")
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }

    /// Counts dead-letter records.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_dead_letter(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM event_records WHERE status = 'dead_letter'")
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }

    /// Counts live records created before the cutoff. Drives the stale-work
    /// health alert.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_live_older_than(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM event_records
            WHERE status <> 'dead_letter' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }

    /// Lists dead-letter records, newest quarantine first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_dead_letters(&self, offset: i64, limit: i64) -> Result<Vec<EventRecord>> {
        let records = sqlx::query_as::<_, EventRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM event_records
            WHERE status = 'dead_letter'
            ORDER BY dead_lettered_at DESC
            OFFSET $1 LIMIT $2
            "#,
        ))
        .bind(offset)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Fetches the oldest dead-letter records for reprocessing.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn oldest_dead_letters(&self, limit: i64) -> Result<Vec<EventRecord>> {
        let records = sqlx::query_as::<_, EventRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM event_records
            WHERE status = 'dead_letter'
            ORDER BY dead_lettered_at ASC
            LIMIT $1
            "#,
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Counts records created since the cutoff, grouped by type and status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn activity_by_type(&self, since: DateTime<Utc>) -> Result<Vec<ActivityCount>> {
        let rows = sqlx::query_as::<_, ActivityCount>(
            r#"
            SELECT event_type, status, COUNT(*) AS count
            FROM event_records
            WHERE created_at >= $1
            GROUP BY event_type, status
            ORDER BY event_type
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Releases stale `enqueued` records back to `pending`.
    ///
    /// A record stuck in `enqueued` since before the cutoff means its broker
    /// message was lost (crash between create and publish, or a dropped
    /// queue). Releasing it makes the sweeper re-enqueue it.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_orphans(&self, cutoff: DateTime<Utc>, due_at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE event_records
            SET status = 'pending', next_attempt_at = $1, updated_at = NOW()
            WHERE status = 'enqueued' AND updated_at < $2
            "#,
        )
        .bind(due_at)
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes dead-letter records quarantined before the cutoff.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_dead_letters_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM event_records
            WHERE status = 'dead_letter' AND dead_lettered_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
