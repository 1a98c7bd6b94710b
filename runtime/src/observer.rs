//! Lifecycle observers.
//!
//! The dispatcher and orchestrator report every phase transition to a
//! [`LifecycleObserver`]. Production code typically installs the
//! [`TracingObserver`]; tests install a recording observer and assert on
//! the notices it collected.

use crate::classifier::FailureDisposition;
use sagaflow_core::error::CompensationFailure;
use sagaflow_core::event::{EventId, TransactionId};
use sagaflow_core::failure::HandlerFailure;
use sagaflow_core::phase::{Outcome, Phase};

/// Something that happened to a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleNotice {
    /// A transaction was opened locally.
    Started {
        /// The transaction
        transaction_id: TransactionId,
    },
    /// A handler is about to run.
    HandlerInvoked {
        /// The transaction
        transaction_id: TransactionId,
        /// The phase being handled
        phase: Phase,
        /// The handler
        handler_id: String,
        /// Delivery number, starting at 1
        attempt: u32,
    },
    /// A handler returned successfully.
    HandlerSucceeded {
        /// The transaction
        transaction_id: TransactionId,
        /// The phase handled
        phase: Phase,
        /// The handler
        handler_id: String,
    },
    /// A handler failed.
    HandlerFailed {
        /// The transaction
        transaction_id: TransactionId,
        /// The phase handled
        phase: Phase,
        /// The handler
        handler_id: String,
        /// The failure raised
        failure: HandlerFailure,
        /// What the dispatcher did about it
        disposition: FailureDisposition,
    },
    /// An event was appended on behalf of the transaction.
    EventPublished {
        /// The transaction
        transaction_id: TransactionId,
        /// Phase of the appended event
        phase: Phase,
    },
    /// A redelivered or superseded event was skipped.
    DuplicateIgnored {
        /// The transaction
        transaction_id: TransactionId,
        /// Phase of the skipped event
        phase: Phase,
        /// The skipped event
        event_id: EventId,
    },
    /// A compensating action completed.
    Compensated {
        /// The transaction
        transaction_id: TransactionId,
        /// The compensating handler or stage
        handler_id: String,
    },
    /// A compensating action failed.
    CompensationFailed {
        /// The transaction
        transaction_id: TransactionId,
        /// The failure
        failure: CompensationFailure,
    },
    /// The transaction reached a terminal state.
    Terminated {
        /// The transaction
        transaction_id: TransactionId,
        /// How it ended
        outcome: Outcome,
    },
}

impl LifecycleNotice {
    /// The transaction the notice is about.
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::Started { transaction_id }
            | Self::HandlerInvoked { transaction_id, .. }
            | Self::HandlerSucceeded { transaction_id, .. }
            | Self::HandlerFailed { transaction_id, .. }
            | Self::EventPublished { transaction_id, .. }
            | Self::DuplicateIgnored { transaction_id, .. }
            | Self::Compensated { transaction_id, .. }
            | Self::CompensationFailed { transaction_id, .. }
            | Self::Terminated { transaction_id, .. } => transaction_id,
        }
    }
}

/// Receives lifecycle notices.
///
/// Implementations must be cheap and must not block: notices are delivered
/// synchronously from dispatcher workers.
pub trait LifecycleObserver: Send + Sync {
    /// Handle one notice.
    fn notify(&self, notice: &LifecycleNotice);
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl LifecycleObserver for NoOpObserver {
    fn notify(&self, _notice: &LifecycleNotice) {}
}

/// Observer that renders notices as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn notify(&self, notice: &LifecycleNotice) {
        match notice {
            LifecycleNotice::Started { transaction_id } => {
                tracing::info!(%transaction_id, "Transaction started");
            },
            LifecycleNotice::HandlerInvoked {
                transaction_id,
                phase,
                handler_id,
                attempt,
            } => {
                tracing::debug!(
                    %transaction_id,
                    %phase,
                    handler = %handler_id,
                    attempt,
                    "Invoking handler"
                );
            },
            LifecycleNotice::HandlerSucceeded {
                transaction_id,
                phase,
                handler_id,
            } => {
                tracing::info!(%transaction_id, %phase, handler = %handler_id, "Handler succeeded");
            },
            LifecycleNotice::HandlerFailed {
                transaction_id,
                phase,
                handler_id,
                failure,
                disposition,
            } => {
                tracing::warn!(
                    %transaction_id,
                    %phase,
                    handler = %handler_id,
                    error = %failure,
                    %disposition,
                    "Handler failed"
                );
            },
            LifecycleNotice::EventPublished { transaction_id, phase } => {
                tracing::debug!(%transaction_id, %phase, "Event published");
            },
            LifecycleNotice::DuplicateIgnored {
                transaction_id,
                phase,
                event_id,
            } => {
                tracing::warn!(%transaction_id, %phase, %event_id, "Duplicate event ignored");
            },
            LifecycleNotice::Compensated {
                transaction_id,
                handler_id,
            } => {
                tracing::info!(%transaction_id, handler = %handler_id, "Compensation completed");
            },
            LifecycleNotice::CompensationFailed {
                transaction_id,
                failure,
            } => {
                tracing::error!(%transaction_id, error = %failure, "Compensation failed");
            },
            LifecycleNotice::Terminated {
                transaction_id,
                outcome,
            } => {
                tracing::info!(%transaction_id, %outcome, "Transaction terminated");
            },
        }
    }
}
