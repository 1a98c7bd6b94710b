//! Event log abstraction.
//!
//! The engine talks to its durable broker only through the [`EventLog`]
//! trait. Implementations provide:
//!
//! - **Append**: each call durably stores exactly one [`SagaEvent`] on a topic
//! - **Consumer groups**: every group sees every entry; within a group each
//!   entry is handed to one consumer at a time
//! - **At-least-once delivery**: entries stay pending until acknowledged and
//!   are redelivered after a visibility timeout if the consumer disappears
//! - **Ordering**: entries of the same transaction arrive in append order
//!
//! ```text
//! SagaManager ──append──▶ ┌───────────┐ ──subscribe──▶ LifecycleDispatcher
//!                         │ EventLog  │                      │
//! dispatcher follow-ups ─▶└───────────┘ ◀──acknowledge───────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use sagaflow_core::event_log::{EventLog, Subscription};
//!
//! async fn drain(log: &dyn EventLog) -> Result<(), EventLogError> {
//!     let subscription = Subscription::new("sagaflow-transactions", "sagaflow", "node-a");
//!     let mut deliveries = log.subscribe(&subscription).await?;
//!     while let Some(delivery) = deliveries.next().await {
//!         let delivery = delivery?;
//!         println!("{} {}", delivery.event.transaction_id, delivery.event.phase);
//!         log.acknowledge(&delivery.token).await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::event::SagaEvent;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during event log operations.
#[derive(Error, Debug, Clone)]
pub enum EventLogError {
    /// Failed to reach the log.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to append an event to a topic.
    #[error("Append failed for topic '{topic}': {reason}")]
    AppendFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic.
    #[error("Subscription failed for topic '{topic}' (group '{group}'): {reason}")]
    SubscriptionFailed {
        /// The topic
        topic: String,
        /// The consumer group
        group: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to acknowledge an entry.
    #[error("Acknowledge failed for entry {entry_id}: {reason}")]
    AcknowledgeFailed {
        /// The entry that could not be acknowledged
        entry_id: EntryId,
        /// The reason for failure
        reason: String,
    },

    /// An entry could not be turned back into an event.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// The log was shut down.
    #[error("Event log closed")]
    Closed,
}

/// Log-assigned position of an appended entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who is reading, and from where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Topic to read.
    pub topic: String,
    /// Consumer group sharing the work.
    pub group: String,
    /// This consumer's name within the group.
    pub consumer: String,
    /// How long an entry may stay unacknowledged before another consumer
    /// reclaims it.
    pub visibility_timeout: Duration,
}

impl Subscription {
    /// Describe a subscription.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer: consumer.into(),
            visibility_timeout: Duration::from_secs(60),
        }
    }

    /// Set the visibility timeout.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// Handle used to acknowledge one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken {
    /// Topic the entry lives on.
    pub topic: String,
    /// Group the entry was delivered to.
    pub group: String,
    /// The entry.
    pub entry_id: EntryId,
}

/// One entry handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The event.
    pub event: SagaEvent,
    /// Acknowledgement handle.
    pub token: DeliveryToken,
    /// How many times this entry has been delivered to the group, starting at 1.
    pub delivery_count: u32,
}

/// Infinite stream of deliveries for one subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventLogError>> + Send>>;

/// Trait for durable event log implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so that the manager and dispatcher can share one `Arc<dyn EventLog>`.
pub trait EventLog: Send + Sync {
    /// Durably append one event to a topic.
    ///
    /// Resolves only after the log has stored the entry.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::AppendFailed`] if the entry was not stored.
    fn append(
        &self,
        topic: &str,
        event: &SagaEvent,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, EventLogError>> + Send + '_>>;

    /// Subscribe to a topic as a member of a consumer group.
    ///
    /// The returned stream first yields entries left pending by crashed
    /// consumers once their visibility timeout elapses, then new entries.
    /// It never ends on its own while the log is open.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::SubscriptionFailed`] if the group cannot be joined.
    fn subscribe(
        &self,
        subscription: &Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventLogError>> + Send + '_>>;

    /// Acknowledge a delivery so it is never redelivered to the group.
    ///
    /// Acknowledging an already acknowledged entry is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::AcknowledgeFailed`] if the log rejects the token.
    fn acknowledge(
        &self,
        token: &DeliveryToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventLogError>> + Send + '_>>;
}
