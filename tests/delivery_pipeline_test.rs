//! End-to-end delivery pipeline scenarios over the in-memory store and
//! broker, driven deterministically with a test clock.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_core::{
    Clock, EventStatus, EventType, MulticastListener, QueueMessage, TestClock,
};
use courier_delivery::{
    store::memory::InMemoryEventStore, worker::decode_message, Broker, CircuitBreakerRegistry,
    CircuitConfig, Coordinator, DeadLetterService, EventHandler, EventStore, FailureClassifier,
    HandlerError, HandlerRegistry, InMemoryBroker, ProcessOutcome, Publisher, PublishOptions,
    RetryPolicy, RetrySweeper, SweeperConfig, DEFAULT_QUEUE,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handler failing a fixed number of times before succeeding.
struct FailNTimes {
    remaining: AtomicU32,
    calls: AtomicU32,
}

impl FailNTimes {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self { remaining: AtomicU32::new(failures), calls: AtomicU32::new(0) })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EventHandler for FailNTimes {
    async fn handle(
        &self,
        _event_type: EventType,
        _payload: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if failed {
            Err(HandlerError::failed("transient downstream failure"))
        } else {
            Ok(())
        }
    }
}

/// Fully wired pipeline over in-memory doubles.
struct Pipeline {
    store: Arc<InMemoryEventStore>,
    clock: TestClock,
    coordinator: Coordinator,
    sweeper: RetrySweeper,
    publisher: Arc<Publisher>,
    registry: HandlerRegistry,
    rx: mpsc::Receiver<serde_json::Value>,
}

impl Pipeline {
    async fn new() -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let clock = TestClock::new();
        let rx = broker.subscribe(DEFAULT_QUEUE).await.unwrap();

        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(CircuitBreakerRegistry::new(
                CircuitConfig::default(),
                Arc::new(clock.clone()),
            )),
            FailureClassifier::new(),
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        );

        let sweeper = RetrySweeper::new(
            store.clone(),
            broker.clone(),
            Arc::new(clock.clone()),
            CancellationToken::new(),
            SweeperConfig::default(),
        );

        let publisher = Arc::new(Publisher::new(
            store.clone(),
            broker,
            Arc::new(MulticastListener::new()),
            Arc::new(clock.clone()),
            DEFAULT_QUEUE,
        ));

        Self {
            store,
            clock,
            coordinator,
            sweeper,
            publisher,
            registry: HandlerRegistry::new(),
            rx,
        }
    }

    /// Receives and decodes the next broker message.
    async fn next_message(&mut self) -> QueueMessage {
        let wire = self.rx.try_recv().expect("expected a queued message");
        decode_message(wire).expect("message should decode")
    }

    async fn process_next(&mut self) -> ProcessOutcome {
        let msg = self.next_message().await;
        self.coordinator.process(&msg, &self.registry).await
    }
}

#[tokio::test]
async fn handler_succeeding_on_third_attempt_completes_without_quarantine() {
    let mut pipeline = Pipeline::new().await;
    let handler = FailNTimes::new(2);
    pipeline.registry.register(EventType::CampaignPublished, handler.clone());

    let event_id = pipeline
        .publisher
        .publish(EventType::CampaignPublished, serde_json::json!({"a": 1}))
        .await
        .unwrap();

    // Attempt 1 fails, scheduling a ~5s retry
    let outcome = pipeline.process_next().await;
    let ProcessOutcome::RetryScheduled { retry_count: 1, next_attempt_at } = outcome else {
        panic!("expected first retry, got {outcome:?}");
    };
    assert_eq!(next_attempt_at - pipeline.clock.now(), chrono::Duration::seconds(5));

    // Not due yet: sweeping now re-enqueues nothing
    assert_eq!(pipeline.sweeper.sweep_once().await.unwrap(), 0);
    pipeline.clock.advance(Duration::from_secs(5));
    assert_eq!(pipeline.sweeper.sweep_once().await.unwrap(), 1);

    // Attempt 2 fails, scheduling a ~10s retry
    let outcome = pipeline.process_next().await;
    let ProcessOutcome::RetryScheduled { retry_count: 2, next_attempt_at } = outcome else {
        panic!("expected second retry, got {outcome:?}");
    };
    assert_eq!(next_attempt_at - pipeline.clock.now(), chrono::Duration::seconds(10));

    pipeline.clock.advance(Duration::from_secs(10));
    assert_eq!(pipeline.sweeper.sweep_once().await.unwrap(), 1);

    // Attempt 3 succeeds; the record is gone and nothing was quarantined
    assert_eq!(pipeline.process_next().await, ProcessOutcome::Completed);
    assert_eq!(handler.calls(), 3);
    assert!(pipeline.store.snapshot(event_id).await.is_none());
    assert_eq!(pipeline.store.count_dead_letter().await.unwrap(), 0);
}

#[tokio::test]
async fn denylisted_type_is_quarantined_on_first_failure() {
    let mut pipeline = Pipeline::new().await;
    let handler = FailNTimes::new(u32::MAX);
    pipeline
        .registry
        .register(EventType::DataCollectionCompleted, handler.clone());

    let event_id = pipeline
        .publisher
        .publish(EventType::DataCollectionCompleted, serde_json::json!({"runId": "r-1"}))
        .await
        .unwrap();

    let outcome = pipeline.process_next().await;
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));
    assert_eq!(handler.calls(), 1, "zero retries for denylisted kinds");

    let record = pipeline.store.snapshot(event_id).await.unwrap();
    assert_eq!(record.status, EventStatus::DeadLetter);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.event_type, EventType::DataCollectionCompleted);
    assert_eq!(record.payload, serde_json::json!({"runId": "r-1"}));

    // Nothing further was scheduled
    pipeline.clock.advance(Duration::from_secs(3600));
    assert_eq!(pipeline.sweeper.sweep_once().await.unwrap(), 0);
}

#[tokio::test]
async fn budget_of_three_quarantines_after_the_fourth_failed_attempt() {
    let mut pipeline = Pipeline::new().await;
    let handler = FailNTimes::new(u32::MAX);
    pipeline.registry.register(EventType::BalanceUpdated, handler.clone());

    let event_id = pipeline
        .publisher
        .publish_with(
            EventType::BalanceUpdated,
            serde_json::json!({"accountId": "a-1"}),
            PublishOptions { max_retries: 3, ..Default::default() },
        )
        .await
        .unwrap();

    // 1 original + 3 retries all fail
    for _ in 0..3 {
        let outcome = pipeline.process_next().await;
        assert!(matches!(outcome, ProcessOutcome::RetryScheduled { .. }));
        pipeline.clock.advance(Duration::from_secs(300));
        assert_eq!(pipeline.sweeper.sweep_once().await.unwrap(), 1);
    }

    let outcome = pipeline.process_next().await;
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));
    assert_eq!(handler.calls(), 4);

    let record = pipeline.store.snapshot(event_id).await.unwrap();
    assert_eq!(record.status, EventStatus::DeadLetter);
    assert_eq!(record.retry_count, 3, "archived record keeps the consumed budget");
}

#[tokio::test]
async fn open_circuit_quarantines_events_with_remaining_budget() {
    let mut pipeline = Pipeline::new().await;
    let handler = FailNTimes::new(u32::MAX);
    pipeline.registry.register(EventType::QuestCompleted, handler.clone());

    // Five distinct events failing with one signature open the circuit
    for _ in 0..5 {
        pipeline
            .publisher
            .publish_with(
                EventType::QuestCompleted,
                serde_json::json!({"questId": "q"}),
                PublishOptions { max_retries: 10, ..Default::default() },
            )
            .await
            .unwrap();
        let outcome = pipeline.process_next().await;
        assert!(matches!(outcome, ProcessOutcome::RetryScheduled { .. }));
    }

    // The next event has its full budget yet is quarantined immediately
    let blocked = pipeline
        .publisher
        .publish_with(
            EventType::QuestCompleted,
            serde_json::json!({"questId": "q"}),
            PublishOptions { max_retries: 10, ..Default::default() },
        )
        .await
        .unwrap();

    let outcome = pipeline.process_next().await;
    let ProcessOutcome::DeadLettered { reason } = outcome else {
        panic!("expected quarantine, got {outcome:?}");
    };
    assert!(reason.contains("circuit open"));

    let record = pipeline.store.snapshot(blocked).await.unwrap();
    assert_eq!(record.status, EventStatus::DeadLetter);
    assert_eq!(record.retry_count, 0);
}

#[tokio::test]
async fn reprocessing_a_batch_republishes_at_most_limit_records() {
    let mut pipeline = Pipeline::new().await;

    // Build a quarantine backlog of 8 by failing a denylisted kind
    let handler = FailNTimes::new(u32::MAX);
    pipeline
        .registry
        .register(EventType::DataCollectionCompleted, handler);

    for i in 0..8 {
        pipeline
            .publisher
            .publish(EventType::DataCollectionCompleted, serde_json::json!({"runId": i}))
            .await
            .unwrap();
        let outcome = pipeline.process_next().await;
        assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));
        pipeline.clock.advance(Duration::from_secs(1));
    }
    assert_eq!(pipeline.store.count_dead_letter().await.unwrap(), 8);

    let service = DeadLetterService::new(pipeline.store.clone(), pipeline.publisher.clone());
    let republished = service.reprocess(5).await.unwrap();

    assert_eq!(republished, 5);
    assert_eq!(pipeline.store.count_dead_letter().await.unwrap(), 3);

    // Each republished event is a fresh record with a reduced budget
    let mut fresh = 0;
    while let Ok(wire) = pipeline.rx.try_recv() {
        let msg = decode_message(wire).unwrap();
        let record = pipeline.store.snapshot(msg.event_id).await.unwrap();
        assert_eq!(record.max_retries, 1);
        assert_eq!(record.retry_count, 0);
        fresh += 1;
    }
    assert_eq!(fresh, 5);
}

#[tokio::test]
async fn publish_creates_exactly_one_record_and_one_message() {
    let mut pipeline = Pipeline::new().await;

    let event_id = pipeline
        .publisher
        .publish(EventType::RewardGranted, serde_json::json!({"rewardId": "r-9"}))
        .await
        .unwrap();

    assert_eq!(pipeline.store.len().await, 1);

    let msg = pipeline.next_message().await;
    assert_eq!(msg.event_id, event_id);
    assert_eq!(msg.attempt, 1);
    assert!(pipeline.rx.try_recv().is_err(), "exactly one message enqueued");
}
