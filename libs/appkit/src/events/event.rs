use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::EventError;

/// A typed event body. The event type string is fixed per payload type.
///
/// ```rust,ignore
/// #[derive(Debug, Clone)]
/// pub struct UserCreated { pub user_id: Uuid }
///
/// impl EventPayload for UserCreated {
///     const EVENT_TYPE: &'static str = "user.created";
/// }
/// ```
pub trait EventPayload: Any + Send + Sync + fmt::Debug {
    const EVENT_TYPE: &'static str;
}

/// Envelope routed by the bus: type string, identity, timestamp and payload.
#[derive(Clone)]
pub struct Event {
    id: Uuid,
    event_type: Cow<'static, str>,
    occurred_at: DateTime<Utc>,
    source: Option<String>,
    payload: Arc<dyn Any + Send + Sync>,
    payload_debug: Arc<dyn fmt::Debug + Send + Sync>,
}

impl Event {
    pub fn new<P: EventPayload>(payload: P) -> Self {
        let payload = Arc::new(payload);
        Self {
            id: Uuid::new_v4(),
            event_type: Cow::Borrowed(P::EVENT_TYPE),
            occurred_at: Utc::now(),
            source: None,
            payload: payload.clone(),
            payload_debug: payload,
        }
    }

    /// Name of the publishing module.
    pub fn with_source(mut self, module: impl Into<String>) -> Self {
        self.source = Some(module.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn is<P: EventPayload>(&self) -> bool {
        self.event_type == P::EVENT_TYPE && self.payload.is::<P>()
    }

    /// Typed view of the payload; fails if the event carries something else.
    pub fn payload<P: EventPayload>(&self) -> Result<&P, EventError> {
        if self.event_type != P::EVENT_TYPE {
            return Err(EventError::PayloadMismatch {
                event_type: self.event_type.to_string(),
                expected: P::EVENT_TYPE,
            });
        }
        self.payload
            .downcast_ref::<P>()
            .ok_or_else(|| EventError::PayloadMismatch {
                event_type: self.event_type.to_string(),
                expected: std::any::type_name::<P>(),
            })
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("occurred_at", &self.occurred_at)
            .field("source", &self.source)
            .field("payload", &self.payload_debug)
            .finish()
    }
}
