//! Dead-letter quarantine: listing and manual reprocessing.
//!
//! Quarantined records keep their original type and payload and are retained
//! indefinitely. Reprocessing republishes them as fresh events with a
//! reduced retry budget; it is the only path back from quarantine.

use std::sync::Arc;

use courier_core::{error::Result as CoreResult, EventRecord};
use tracing::{info, warn};

use crate::{
    publisher::{PublishOptions, Publisher},
    store::EventStore,
};

/// Retry budget granted to a reprocessed event.
const REPROCESS_MAX_RETRIES: u32 = 1;

/// Service over the dead-letter backlog.
pub struct DeadLetterService {
    store: Arc<dyn EventStore>,
    publisher: Arc<Publisher>,
}

impl DeadLetterService {
    /// Creates a service over the given store and publisher.
    pub fn new(store: Arc<dyn EventStore>, publisher: Arc<Publisher>) -> Self {
        Self { store, publisher }
    }

    /// Lists quarantined records, newest first. `page` is 1-based.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, page: i64, limit: i64) -> CoreResult<Vec<EventRecord>> {
        let page = page.max(1);
        let limit = limit.clamp(1, 500);

        self.store.list_dead_letters((page - 1) * limit, limit).await
    }

    /// Republishes up to `limit` quarantined records as fresh events.
    ///
    /// Oldest records go first. A record that republishes successfully is
    /// deleted from quarantine; one that fails is logged and left in place.
    /// Returns the number of records republished.
    ///
    /// # Errors
    ///
    /// Returns error only if the backlog cannot be read; per-record publish
    /// failures are not errors.
    pub async fn reprocess(&self, limit: i64) -> CoreResult<usize> {
        let backlog = self.store.oldest_dead_letters(limit.max(0)).await?;
        let mut republished = 0;

        for record in backlog {
            let options = PublishOptions {
                max_retries: REPROCESS_MAX_RETRIES,
                priority: record.priority,
                ..Default::default()
            };

            match self
                .publisher
                .publish_with(record.event_type, record.payload.clone(), options)
                .await
            {
                Ok(new_id) => {
                    republished += 1;
                    if let Err(e) = self.store.delete(record.id).await {
                        warn!(
                            event_id = %record.id,
                            error = %e,
                            "republished dead letter could not be deleted"
                        );
                    }
                    info!(
                        event_id = %record.id,
                        new_event_id = %new_id,
                        event_type = %record.event_type,
                        "dead letter republished"
                    );
                },
                Err(e) => {
                    warn!(
                        event_id = %record.id,
                        event_type = %record.event_type,
                        error = %e,
                        "dead letter republish failed, leaving in quarantine"
                    );
                },
            }
        }

        Ok(republished)
    }
}
