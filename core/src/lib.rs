//! # Sagaflow Core
//!
//! Core traits and types for the Sagaflow saga engine.
//!
//! This crate defines the data model shared by every part of the engine:
//! lifecycle phases, events, transactions, payloads, the failure and error
//! taxonomies, and the abstract [`EventLog`](event_log::EventLog) the engine
//! is built against. It contains no runtime; see `sagaflow-runtime` for the
//! dispatcher, client API and orchestrator.
//!
//! ## Core Concepts
//!
//! - **Transaction**: one saga instance, identified by a [`TransactionId`]
//! - **Phase**: `START`, `JOIN`, `COMMIT` or `ROLLBACK`
//! - **Event**: an immutable [`SagaEvent`] appended to the log for a phase
//! - **Participant**: a handler that joined and must be compensated on rollback
//! - **Failure kind**: closed [`FailureKind`] taxonomy driving retry and rollback
//!
//! ## Lifecycle
//!
//! ```text
//! START ──▶ JOIN* ──▶ COMMIT ──▶ TERMINATED(COMMITTED)
//!   │         │         │
//!   └─────────┴─────────┴──▶ ROLLBACK ──▶ TERMINATED(ROLLED_BACK)
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod codec;
pub mod environment;
pub mod error;
pub mod event;
pub mod event_log;
pub mod failure;
pub mod payload;
pub mod phase;
pub mod transaction;

pub use codec::{Codec, CodecError};
pub use error::{CompensationFailure, CompensationFailures, ErrorKind, SagaError};
pub use event::{EventId, SagaEvent, TransactionId};
pub use event_log::{
    Delivery, DeliveryStream, DeliveryToken, EntryId, EventLog, EventLogError, Subscription,
};
pub use failure::{FailureKind, FailureKindSet, HandlerFailure};
pub use payload::{EncodedPayload, Payload, PayloadFilter};
pub use phase::{Outcome, Phase, TransactionState};
pub use transaction::{ParticipantRecord, Transaction};
