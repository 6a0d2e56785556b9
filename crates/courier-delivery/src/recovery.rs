//! Startup reconciliation and retention.
//!
//! A record stuck in `enqueued` from before this process started means its
//! broker message is gone: a crash between the durable write and the
//! enqueue, or a queue that lost it. The startup scan releases those records
//! back to `pending` so the sweeper re-enqueues them. A periodic pass purges
//! quarantined records past the retention window.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{error::Result, store::EventStore};

/// Configuration for the recovery service.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often the purge pass runs.
    pub purge_interval: Duration,

    /// Age past which quarantined records are purged.
    pub dead_letter_retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            purge_interval: Duration::from_secs(6 * 60 * 60),
            dead_letter_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Reconciles orphaned records at startup and enforces retention.
pub struct RecoveryService {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    config: RecoveryConfig,
}

impl RecoveryService {
    /// Creates a recovery service over the given collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
        config: RecoveryConfig,
    ) -> Self {
        Self { store, clock, cancellation_token, config }
    }

    /// Releases records orphaned before this process started.
    ///
    /// Returns the number of records handed back to the sweeper.
    ///
    /// # Errors
    ///
    /// Returns error if the release update fails.
    pub async fn reconcile_orphans(&self) -> Result<u64> {
        let now = self.clock.now();
        let released = self.store.release_orphans(now, now).await?;

        if released > 0 {
            info!(released, "orphaned records released for re-enqueue");
        }

        Ok(released)
    }

    /// Runs the periodic purge loop until cancelled.
    pub async fn run(&self) {
        info!(
            purge_interval_hours = self.config.purge_interval.as_secs() / 3600,
            retention_days = self.config.dead_letter_retention.as_secs() / 86_400,
            "recovery service starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.purge_interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }

            if let Err(e) = self.purge_once().await {
                error!(error = %e, "dead-letter purge failed");
            }
        }

        info!("recovery service stopped");
    }

    /// Purges quarantined records past the retention window. Exposed for
    /// tests and controlled runs.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_once(&self) -> Result<u64> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.dead_letter_retention).unwrap_or_default();

        let purged = self.store.purge_dead_letters_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "expired dead letters purged");
        }

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{EventStatus, EventType, NewEvent, Priority, TestClock};

    use super::*;
    use crate::store::memory::InMemoryEventStore;

    fn service(store: Arc<InMemoryEventStore>, clock: &TestClock) -> RecoveryService {
        RecoveryService::new(
            store,
            Arc::new(clock.clone()),
            CancellationToken::new(),
            RecoveryConfig::default(),
        )
    }

    async fn seed(
        store: &InMemoryEventStore,
        status: EventStatus,
        created_at: chrono::DateTime<Utc>,
    ) -> courier_core::EventId {
        store
            .create(&NewEvent {
                event_type: EventType::CampaignPublished,
                payload: serde_json::Value::Null,
                status,
                max_retries: 3,
                priority: Priority::Normal,
                next_attempt_at: None,
                created_at,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stale_enqueued_records_are_released() {
        let store = Arc::new(InMemoryEventStore::new());
        let clock = TestClock::new();

        let orphan =
            seed(&store, EventStatus::Enqueued, clock.now() - chrono::Duration::hours(1)).await;

        let recovery = service(store.clone(), &clock);
        let released = recovery.reconcile_orphans().await.unwrap();

        assert_eq!(released, 1);
        let record = store.snapshot(orphan).await.unwrap();
        assert_eq!(record.status, EventStatus::Pending);
        assert!(record.next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn fresh_enqueued_records_are_untouched() {
        let store = Arc::new(InMemoryEventStore::new());
        let clock = TestClock::new();

        // Created "now" relative to the recovery scan, so not an orphan
        clock.advance(Duration::from_secs(1));
        let fresh = seed(&store, EventStatus::Enqueued, clock.now()).await;

        let recovery = service(store.clone(), &clock);
        let released = recovery.reconcile_orphans().await.unwrap();

        assert_eq!(released, 0);
        assert_eq!(store.snapshot(fresh).await.unwrap().status, EventStatus::Enqueued);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_dead_letters() {
        let store = Arc::new(InMemoryEventStore::new());
        let clock = TestClock::new();

        let expired = seed(&store, EventStatus::Enqueued, clock.now()).await;
        store
            .mark_dead_letter(expired, "old poison", clock.now() - chrono::Duration::days(45))
            .await
            .unwrap();

        let recent = seed(&store, EventStatus::Enqueued, clock.now()).await;
        store
            .mark_dead_letter(recent, "new poison", clock.now() - chrono::Duration::days(5))
            .await
            .unwrap();

        let recovery = service(store.clone(), &clock);
        let purged = recovery.purge_once().await.unwrap();

        assert_eq!(purged, 1);
        assert!(store.snapshot(expired).await.is_none());
        assert!(store.snapshot(recent).await.is_some());
    }
}
