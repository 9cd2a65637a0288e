//! In-process event bus.
//!
//! Events are routed by type string. A handler declares the types it accepts
//! and is subscribed to each of them; publishing fans out to every handler
//! subscribed to the event's type, either inline (`publish`) or through a
//! bounded queue drained by a worker pool (`publish_async`).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod bus;
mod event;

pub use bus::{BusState, BusStats, BusStopOutcome, EventBus, PublishReport};
pub use event::{Event, EventPayload};

/// A subscriber. Must be safe to invoke concurrently.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identity used in logs and reports.
    fn name(&self) -> &str;

    /// Event types this handler accepts.
    fn event_types(&self) -> &[&'static str];

    fn handles(&self, event_type: &str) -> bool {
        self.event_types().contains(&event_type)
    }

    /// `cancel` fires when the bus gives up on in-flight deliveries.
    async fn handle(&self, cancel: &CancellationToken, event: &Event) -> anyhow::Result<()>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event '{event_type}' does not carry a {expected} payload")]
    PayloadMismatch {
        event_type: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("handler '{handler}' does not declare event type '{event_type}'")]
    UndeclaredType { handler: String, event_type: String },
    #[error("event queue is full (capacity {capacity}), dropped '{event_type}'")]
    QueueFull { event_type: String, capacity: usize },
    #[error("event bus is stopped")]
    Stopped,
}

/// Why a single delivery failed.
#[derive(Debug)]
pub enum HandlerFailure {
    Error(anyhow::Error),
    Panicked(String),
    TimedOut(Duration),
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e:#}"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
            Self::TimedOut(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

#[derive(Debug, Error)]
#[error("handler '{handler}' failed on '{event_type}': {failure}")]
pub struct HandlerError {
    pub handler: String,
    pub event_type: String,
    pub failure: HandlerFailure,
}
