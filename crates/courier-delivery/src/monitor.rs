//! Stats and health services behind the monitoring surface.
//!
//! Pending counts cover every live record; completed work leaves no trace
//! because records are deleted on completion, a deliberate trade of history
//! for storage minimalism. Health trips on stale pending work or a growing
//! dead-letter backlog.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{error::Result as CoreResult, Clock, EventStatus};
use serde::Serialize;

use crate::store::EventStore;

/// Snapshot of the delivery backlog.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeliveryStats {
    /// Live records awaiting or undergoing delivery.
    pub pending: i64,
    /// Quarantined records.
    pub dead_letter: i64,
}

/// Per-event-type activity within a time window.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    /// Event kind tag.
    pub event_type: String,
    /// Live records created in the window.
    pub pending: i64,
    /// Records created in the window that ended up quarantined.
    pub dead_letter: i64,
    /// Total records created in the window.
    pub total: i64,
}

/// Read-side service over backlog counters.
pub struct StatsService {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
}

impl StatsService {
    /// Creates a stats service.
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current backlog counts.
    ///
    /// # Errors
    ///
    /// Returns error if a count query fails.
    pub async fn stats(&self) -> CoreResult<DeliveryStats> {
        let pending = self.store.count_live().await?;
        let dead_letter = self.store.count_dead_letter().await?;

        Ok(DeliveryStats { pending, dead_letter })
    }

    /// Per-type activity over the trailing `hours` window.
    ///
    /// # Errors
    ///
    /// Returns error if the group-by query fails.
    pub async fn activity(&self, hours: u32) -> CoreResult<Vec<ActivityEntry>> {
        let since = self.clock.now() - chrono::Duration::hours(i64::from(hours));
        let rows = self.store.activity_by_type(since).await?;

        let mut entries: BTreeMap<String, ActivityEntry> = BTreeMap::new();
        for row in rows {
            let entry = entries.entry(row.event_type.clone()).or_insert_with(|| ActivityEntry {
                event_type: row.event_type.clone(),
                pending: 0,
                dead_letter: 0,
                total: 0,
            });

            entry.total += row.count;
            if row.status == EventStatus::DeadLetter.as_str() {
                entry.dead_letter += row.count;
            } else {
                entry.pending += row.count;
            }
        }

        Ok(entries.into_values().collect())
    }
}

/// Thresholds that trip the health endpoint.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Age past which a live record counts as stale.
    pub stale_age: Duration,

    /// Stale live records at or above this count trip the alert.
    pub stale_count_max: i64,

    /// Dead-letter records at or above this count trip the alert.
    pub dead_letter_max: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_age: Duration::from_secs(15 * 60),
            stale_count_max: 100,
            dead_letter_max: 100,
        }
    }
}

/// One tripped health threshold.
#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    /// Alert identifier (`stale_events`, `dead_letter_backlog`).
    pub name: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Observed value.
    pub count: i64,
    /// Configured threshold.
    pub threshold: i64,
}

/// Health report returned by the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Whether every threshold is within bounds.
    pub healthy: bool,
    /// Tripped thresholds, empty when healthy.
    pub alerts: Vec<HealthAlert>,
    /// Current backlog counts.
    pub stats: DeliveryStats,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

/// Evaluates delivery health against configured thresholds.
pub struct HealthService {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,
}

impl HealthService {
    /// Creates a health service with the given thresholds.
    pub fn new(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self { store, clock, thresholds }
    }

    /// Runs the health check.
    ///
    /// # Errors
    ///
    /// Returns error if a count query fails.
    pub async fn check(&self) -> CoreResult<HealthReport> {
        let now = self.clock.now();
        let stale_cutoff =
            now - chrono::Duration::from_std(self.thresholds.stale_age).unwrap_or_default();

        let pending = self.store.count_live().await?;
        let dead_letter = self.store.count_dead_letter().await?;
        let stale = self.store.count_live_older_than(stale_cutoff).await?;

        let mut alerts = Vec::new();

        if stale >= self.thresholds.stale_count_max {
            alerts.push(HealthAlert {
                name: "stale_events",
                message: format!(
                    "{stale} events older than {}s are still undelivered",
                    self.thresholds.stale_age.as_secs()
                ),
                count: stale,
                threshold: self.thresholds.stale_count_max,
            });
        }

        if dead_letter >= self.thresholds.dead_letter_max {
            alerts.push(HealthAlert {
                name: "dead_letter_backlog",
                message: format!("{dead_letter} events are quarantined"),
                count: dead_letter,
                threshold: self.thresholds.dead_letter_max,
            });
        }

        Ok(HealthReport {
            healthy: alerts.is_empty(),
            alerts,
            stats: DeliveryStats { pending, dead_letter },
            checked_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{EventType, NewEvent, Priority, TestClock};

    use super::*;
    use crate::store::{memory::InMemoryEventStore, EventStore};

    async fn seed(
        store: &InMemoryEventStore,
        event_type: EventType,
        created_at: DateTime<Utc>,
        dead_letter: bool,
    ) {
        let id = store
            .create(&NewEvent {
                event_type,
                payload: serde_json::Value::Null,
                status: EventStatus::Enqueued,
                max_retries: 3,
                priority: Priority::Normal,
                next_attempt_at: None,
                created_at,
            })
            .await
            .unwrap();

        if dead_letter {
            store.mark_dead_letter(id, "poison", created_at).await.unwrap();
        }
    }

    #[tokio::test]
    async fn stats_split_live_and_quarantined() {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryEventStore::new());

        seed(&store, EventType::CampaignPublished, clock.now(), false).await;
        seed(&store, EventType::CampaignPublished, clock.now(), false).await;
        seed(&store, EventType::QuestCompleted, clock.now(), true).await;

        let service = StatsService::new(store, Arc::new(clock));
        let stats = service.stats().await.unwrap();

        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dead_letter, 1);
    }

    #[tokio::test]
    async fn activity_windows_by_creation_time() {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryEventStore::new());

        seed(&store, EventType::CampaignPublished, clock.now(), false).await;
        seed(&store, EventType::CampaignPublished, clock.now(), true).await;
        seed(
            &store,
            EventType::QuestCompleted,
            clock.now() - chrono::Duration::hours(48),
            false,
        )
        .await;

        let service = StatsService::new(store, Arc::new(clock));
        let activity = service.activity(24).await.unwrap();

        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].event_type, "campaign.published");
        assert_eq!(activity[0].total, 2);
        assert_eq!(activity[0].pending, 1);
        assert_eq!(activity[0].dead_letter, 1);
    }

    #[tokio::test]
    async fn healthy_when_backlog_is_fresh_and_small() {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, EventType::CampaignPublished, clock.now(), false).await;

        let service =
            HealthService::new(store, Arc::new(clock), HealthThresholds::default());
        let report = service.check().await.unwrap();

        assert!(report.healthy);
        assert!(report.alerts.is_empty());
    }

    #[tokio::test]
    async fn stale_pending_work_trips_the_alert() {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryEventStore::new());

        let stale_age = chrono::Duration::hours(1);
        for _ in 0..3 {
            seed(&store, EventType::BalanceUpdated, clock.now() - stale_age, false).await;
        }

        let thresholds = HealthThresholds {
            stale_age: Duration::from_secs(15 * 60),
            stale_count_max: 3,
            dead_letter_max: 100,
        };
        let service = HealthService::new(store, Arc::new(clock), thresholds);
        let report = service.check().await.unwrap();

        assert!(!report.healthy);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].name, "stale_events");
        assert_eq!(report.alerts[0].count, 3);
    }

    #[tokio::test]
    async fn dead_letter_backlog_trips_the_alert() {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryEventStore::new());

        for _ in 0..2 {
            seed(&store, EventType::QuestCompleted, clock.now(), true).await;
        }

        let thresholds = HealthThresholds { dead_letter_max: 2, ..Default::default() };
        let service = HealthService::new(store, Arc::new(clock), thresholds);
        let report = service.check().await.unwrap();

        assert!(!report.healthy);
        assert_eq!(report.alerts[0].name, "dead_letter_backlog");
    }

    #[tokio::test]
    async fn both_alerts_can_trip_together() {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryEventStore::new());

        seed(
            &store,
            EventType::CampaignPublished,
            clock.now() - chrono::Duration::hours(2),
            false,
        )
        .await;
        seed(&store, EventType::QuestCompleted, clock.now(), true).await;

        let thresholds = HealthThresholds {
            stale_age: Duration::from_secs(60),
            stale_count_max: 1,
            dead_letter_max: 1,
        };
        let service = HealthService::new(store, Arc::new(clock), thresholds);
        let report = service.check().await.unwrap();

        assert!(!report.healthy);
        assert_eq!(report.alerts.len(), 2);
    }
}
