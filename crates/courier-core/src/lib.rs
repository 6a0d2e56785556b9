//! Core domain models and persistence for the courier event-delivery system.
//!
//! Provides strongly-typed event records, the closed set of event kinds,
//! error handling, clock abstraction, publish-notification hooks, and the
//! PostgreSQL repository layer. All other crates depend on these
//! foundational types for type safety and consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod notify;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    EventId, EventRecord, EventStatus, EventType, NewEvent, Priority, QueueMessage,
};
pub use notify::{MulticastListener, NoOpListener, PublishListener, PublishNotice};
pub use time::{Clock, RealClock, TestClock};
