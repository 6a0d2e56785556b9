//! Failure classification for the retry/dead-letter decision.
//!
//! Classification is a closed outcome derived from the structured handler
//! error variant and the event-type denylist, never from matching on error
//! message phrasing. Denylisted kinds carry non-idempotent side effects, so
//! a second attempt could double-apply them.

use std::collections::HashSet;

use courier_core::EventType;

use crate::error::HandlerError;

/// Closed classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Safe to retry within the event's budget.
    Retryable,
    /// Needs human or operational remediation; dead-letter immediately.
    NonRetryable,
}

/// Classifies handler failures into a closed retry decision.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    denylist: HashSet<EventType>,
}

impl FailureClassifier {
    /// Creates a classifier with the default denylist.
    pub fn new() -> Self {
        Self::with_denylist([EventType::DataCollectionCompleted])
    }

    /// Creates a classifier denylisting the given event kinds.
    pub fn with_denylist(denylist: impl IntoIterator<Item = EventType>) -> Self {
        Self { denylist: denylist.into_iter().collect() }
    }

    /// Whether the event kind is denylisted from retrying.
    pub fn is_denylisted(&self, event_type: EventType) -> bool {
        self.denylist.contains(&event_type)
    }

    /// Classifies a failure of the given event kind.
    ///
    /// Denylisted kinds are non-retryable regardless of the error. Rate
    /// limits and downstream contract violations are non-retryable because
    /// mechanical retries cannot fix them.
    pub fn classify(&self, event_type: EventType, error: &HandlerError) -> FailureClass {
        if self.is_denylisted(event_type) {
            return FailureClass::NonRetryable;
        }

        match error {
            HandlerError::RateLimited { .. } | HandlerError::ContractViolation { .. } => {
                FailureClass::NonRetryable
            },
            HandlerError::Failed { .. } => FailureClass::Retryable,
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_failures_are_retryable() {
        let classifier = FailureClassifier::new();
        let class = classifier
            .classify(EventType::CampaignPublished, &HandlerError::failed("timeout"));
        assert_eq!(class, FailureClass::Retryable);
    }

    #[test]
    fn rate_limits_are_not_retryable() {
        let classifier = FailureClassifier::new();
        let class = classifier
            .classify(EventType::BalanceUpdated, &HandlerError::rate_limited("429"));
        assert_eq!(class, FailureClass::NonRetryable);
    }

    #[test]
    fn contract_violations_are_not_retryable() {
        let classifier = FailureClassifier::new();
        let class = classifier.classify(
            EventType::QuestCompleted,
            &HandlerError::contract_violation("unknown quest id"),
        );
        assert_eq!(class, FailureClass::NonRetryable);
    }

    #[test]
    fn denylisted_kinds_never_retry() {
        let classifier = FailureClassifier::new();
        let class = classifier
            .classify(EventType::DataCollectionCompleted, &HandlerError::failed("flake"));
        assert_eq!(class, FailureClass::NonRetryable);
    }

    #[test]
    fn custom_denylist_overrides_default() {
        let classifier = FailureClassifier::with_denylist([EventType::RewardGranted]);
        assert!(classifier.is_denylisted(EventType::RewardGranted));
        assert!(!classifier.is_denylisted(EventType::DataCollectionCompleted));
    }
}
