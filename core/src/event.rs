//! Lifecycle events and their identifiers.
//!
//! A [`SagaEvent`] is immutable once appended to the log. The engine only
//! interprets its `transaction_id` and `phase`; payload bytes are opaque and
//! decoded by handlers through a [`Codec`](crate::codec::Codec).
//!
//! Events serialize to `bincode` bytes for byte-oriented log adapters, the
//! same way domain events do in an event store.

use crate::payload::EncodedPayload;
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event (de)serialization.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// Globally unique identifier of one saga instance.
///
/// It is the join key across every event belonging to that saga.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier of one appended event, used for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// A fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaEvent {
    /// Unique id of this event.
    pub event_id: EventId,
    /// The transaction this event belongs to.
    pub transaction_id: TransactionId,
    /// Lifecycle phase requested by this event.
    pub phase: Phase,
    /// Typed payload, if any.
    pub payload: Option<EncodedPayload>,
    /// Undo payload captured at join time (`Join` only).
    pub undo: Option<EncodedPayload>,
    /// Human-readable rollback cause (`Rollback` only).
    pub cause: Option<String>,
    /// The event whose handling produced this one.
    pub causation_id: Option<EventId>,
    /// Name of the node that appended the event.
    pub origin: String,
    /// When the event was created.
    pub created_at: DateTime<Utc>,
}

impl SagaEvent {
    /// Create an event without payload, undo data, cause, or causation.
    #[must_use]
    pub fn new(
        transaction_id: TransactionId,
        phase: Phase,
        origin: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            transaction_id,
            phase,
            payload: None,
            undo: None,
            cause: None,
            causation_id: None,
            origin: origin.into(),
            created_at,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Option<EncodedPayload>) -> Self {
        self.payload = payload;
        self
    }

    /// Attach an undo payload.
    #[must_use]
    pub fn with_undo(mut self, undo: Option<EncodedPayload>) -> Self {
        self.undo = undo;
        self
    }

    /// Attach a rollback cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Record the event that caused this one.
    #[must_use]
    pub const fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(event_id);
        self
    }

    /// Type tag of the payload, if one is attached.
    #[must_use]
    pub fn payload_type(&self) -> Option<&str> {
        self.payload.as_ref().map(|p| p.type_tag.as_str())
    }

    /// Serialize to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are not a
    /// serialized event.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::codec::Codec;

    #[test]
    fn builder_sets_optional_fields() {
        let parent = EventId::new();
        let payload = EncodedPayload::encode(Codec::Json, &7_i64).unwrap();
        let event = SagaEvent::new("tx-1".into(), Phase::Rollback, "node-a", Utc::now())
            .with_payload(Some(payload))
            .with_cause("stock exhausted")
            .caused_by(parent);

        assert_eq!(event.transaction_id.as_str(), "tx-1");
        assert_eq!(event.cause.as_deref(), Some("stock exhausted"));
        assert_eq!(event.causation_id, Some(parent));
        assert_eq!(event.payload_type(), Some(std::any::type_name::<i64>()));
        assert!(event.undo.is_none());
    }

    #[test]
    fn bincode_bytes_restore_event() {
        let event = SagaEvent::new("tx-2".into(), Phase::Join, "node-a", Utc::now())
            .with_undo(Some(EncodedPayload::new("Undo".to_string(), vec![1, 2, 3])));

        let bytes = event.to_bytes().unwrap();
        assert_eq!(SagaEvent::from_bytes(&bytes).unwrap(), event);
    }

    #[test]
    fn garbage_bytes_fail_to_deserialize() {
        assert!(matches!(
            SagaEvent::from_bytes(&[0xff, 0x00]),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }
}
