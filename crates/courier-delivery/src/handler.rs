//! Handler contract and dispatch table.
//!
//! Domain code implements [`EventHandler`] per event kind and registers it in
//! a [`HandlerRegistry`] keyed by the closed [`EventType`] enum. Event kinds
//! without a registered handler are logged and skipped by the worker; they
//! are not an error.

use std::{collections::HashMap, sync::Arc};

use courier_core::EventType;

use crate::error::HandlerError;

/// Trait implemented by domain event handlers.
///
/// A handler either returns `Ok(())` (the event completes and its record is
/// deleted) or a [`HandlerError`] that drives the retry/dead-letter
/// decision. Handlers must tolerate at-least-once delivery.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event delivery attempt.
    async fn handle(
        &self,
        event_type: EventType,
        payload: &serde_json::Value,
    ) -> Result<(), HandlerError>;
}

/// Dispatch table mapping event kinds to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an event kind, replacing any previous one.
    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type, handler);
    }

    /// Looks up the handler for an event kind.
    pub fn get(&self, event_type: EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&event_type).cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
