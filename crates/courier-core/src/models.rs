//! Core domain models and strongly-typed identifiers.
//!
//! Defines event records, the closed set of event kinds, delivery status,
//! priorities, and the broker wire message. Includes database serialization
//! impls so repositories can read and write records without stringly-typed
//! columns leaking into domain logic.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Error returned when a stored tag does not match any known variant.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} tag: {value}")]
pub struct UnknownTag {
    /// Which tag family failed to parse (event type, status, priority).
    pub kind: &'static str,
    /// The offending tag value.
    pub value: String,
}

/// Strongly-typed event record identifier.
///
/// Wraps the store-assigned `BIGSERIAL` value: monotonically increasing,
/// unique, and valid for the whole lifetime of the record across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// The closed set of domain event kinds moved by the delivery core.
///
/// The payload attached to each kind stays opaque to the core; the tag is
/// only used for handler dispatch, failure classification, and circuit
/// breaker keying. Unknown tags fail decoding at the wire and storage
/// boundaries instead of falling through to a runtime "unhandled type".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A campaign became visible to participants.
    #[serde(rename = "campaign.published")]
    CampaignPublished,

    /// A campaign reached its end state.
    #[serde(rename = "campaign.completed")]
    CampaignCompleted,

    /// A participant completed a quest.
    #[serde(rename = "quest.completed")]
    QuestCompleted,

    /// An account balance changed.
    #[serde(rename = "balance.updated")]
    BalanceUpdated,

    /// A reward was granted to a participant.
    #[serde(rename = "reward.granted")]
    RewardGranted,

    /// A data-collection run finished. Side effects of its handler are not
    /// idempotent, so this kind is never retried after a failure.
    #[serde(rename = "data_collection.completed")]
    DataCollectionCompleted,
}

impl EventType {
    /// All known event kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::CampaignPublished,
        Self::CampaignCompleted,
        Self::QuestCompleted,
        Self::BalanceUpdated,
        Self::RewardGranted,
        Self::DataCollectionCompleted,
    ];

    /// Canonical string tag used on the wire and in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CampaignPublished => "campaign.published",
            Self::CampaignCompleted => "campaign.completed",
            Self::QuestCompleted => "quest.completed",
            Self::BalanceUpdated => "balance.updated",
            Self::RewardGranted => "reward.granted",
            Self::DataCollectionCompleted => "data_collection.completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTag { kind: "event type", value: s.to_string() })
    }
}

impl sqlx::Type<PgDb> for EventType {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for EventType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Lifecycle state of a durable event record.
///
/// Exactly one record exists per published event until it completes (record
/// deleted) or is quarantined. The state is an explicit column, so a record
/// is never in two states at once and no naming convention carries meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Durable and due for (re-)enqueue once `next_attempt_at` elapses.
    Pending,
    /// A broker message referencing this record is queued or in flight.
    Enqueued,
    /// Quarantined after classification or retry exhaustion.
    DeadLetter,
}

impl EventStatus {
    /// Canonical string tag used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Enqueued => "enqueued",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "enqueued" => Ok(Self::Enqueued),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(UnknownTag { kind: "event status", value: s.to_string() }),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Delivery priority carried on broker messages.
///
/// Retries are re-enqueued one step lower than the original publish so
/// poison-adjacent traffic never starves fresh events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Delivered ahead of normal traffic.
    High,
    /// Default priority.
    #[default]
    Normal,
    /// Background traffic, typically retries.
    Low,
}

impl Priority {
    /// Canonical string tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// The next lower priority; `Low` stays `Low`.
    pub const fn lowered(self) -> Self {
        match self {
            Self::High => Self::Normal,
            Self::Normal | Self::Low => Self::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(UnknownTag { kind: "priority", value: s.to_string() }),
        }
    }
}

impl sqlx::Type<PgDb> for Priority {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Priority {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for Priority {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A durable event record, the unit of at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    /// Store-assigned monotonically increasing identifier.
    pub id: EventId,

    /// Domain event kind.
    pub event_type: EventType,

    /// Opaque domain payload.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub status: EventStatus,

    /// Number of retries already consumed (0 for a fresh publish).
    pub retry_count: i32,

    /// Retry budget for this event.
    pub max_retries: i32,

    /// Priority of the original publish.
    pub priority: Priority,

    /// Message of the most recent handler failure, if any.
    pub last_error: Option<String>,

    /// When the most recent retry was scheduled.
    pub last_retry_at: Option<DateTime<Utc>>,

    /// When the record becomes due for (re-)enqueue. `None` while a broker
    /// message is believed to be in flight.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When the record was quarantined, if it was.
    pub dead_lettered_at: Option<DateTime<Utc>>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Whether this record has been quarantined.
    pub fn is_dead_letter(&self) -> bool {
        self.status == EventStatus::DeadLetter
    }

    /// The 1-based attempt number the next delivery of this record carries.
    pub fn next_attempt_number(&self) -> u32 {
        u32::try_from(self.retry_count).unwrap_or(0) + 1
    }
}

/// Parameters for creating a durable event record.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Domain event kind.
    pub event_type: EventType,
    /// Opaque domain payload.
    pub payload: serde_json::Value,
    /// Initial lifecycle state (`Enqueued` for immediate publishes,
    /// `Pending` for delayed ones).
    pub status: EventStatus,
    /// Retry budget.
    pub max_retries: i32,
    /// Publish priority.
    pub priority: Priority,
    /// Due time for delayed publishes.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// The broker wire message referencing a durable record.
///
/// Retries are re-enqueued as new messages carrying the same `event_id` with
/// an incremented `attempt`, so two in-flight messages for one record are
/// possible under broker redelivery. Field names match the wire contract of
/// the producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Unique id of this particular message (not the event).
    #[serde(default = "Uuid::new_v4")]
    pub message_id: Uuid,

    /// Durable record this message references.
    pub event_id: EventId,

    /// Domain event kind.
    pub event_type: EventType,

    /// Opaque domain payload.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// 1-based attempt number this delivery represents.
    #[serde(default = "default_attempt")]
    pub attempt: u32,

    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
}

fn default_attempt() -> u32 {
    1
}
