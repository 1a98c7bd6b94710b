//! Client-facing error taxonomy.
//!
//! Every error surfaced to a caller is a [`SagaError`] carrying a stable
//! [`ErrorKind`] tag. Compensation failures are aggregated per transaction
//! into [`CompensationFailures`] rather than reported one by one.

use crate::codec::CodecError;
use crate::event::TransactionId;
use crate::event_log::EventLogError;
use crate::failure::HandlerFailure;
use crate::phase::{Phase, TransactionState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable tag identifying the variant of a [`SagaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The transaction id is not known.
    UnknownTransaction,
    /// The requested phase is not valid for the transaction's state.
    InvalidPhase,
    /// A payload could not be encoded.
    Encode,
    /// A payload could not be decoded.
    Decode,
    /// Application handler code failed.
    HandlerFailure,
    /// One or more compensations failed.
    Compensation,
    /// No handler is registered for an event.
    MissingHandler,
    /// A handler registration is malformed or conflicts with another.
    InvalidRegistration,
    /// The event log failed.
    EventLog,
    /// An operation did not finish in time.
    Timeout,
    /// An operation was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTransaction => "unknown_transaction",
            Self::InvalidPhase => "invalid_phase",
            Self::Encode => "encode",
            Self::Decode => "decode",
            Self::HandlerFailure => "handler_failure",
            Self::Compensation => "compensation",
            Self::MissingHandler => "missing_handler",
            Self::InvalidRegistration => "invalid_registration",
            Self::EventLog => "event_log",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compensating action that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("compensation by '{handler_id}' failed after {attempts} attempt(s): {failure}")]
pub struct CompensationFailure {
    /// The compensating handler or orchestrator stage.
    pub handler_id: String,
    /// Type tag of the payload being compensated, if any.
    pub payload_type: Option<String>,
    /// The last failure raised.
    pub failure: HandlerFailure,
    /// How many times the compensation was attempted.
    pub attempts: u32,
}

/// Every compensation failure of one rollback.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailures {
    /// The transaction that was rolled back.
    pub transaction_id: TransactionId,
    /// Individual failures, in the order compensations ran.
    pub failures: Vec<CompensationFailure>,
}

impl CompensationFailures {
    /// Start an empty aggregate.
    #[must_use]
    pub const fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            failures: Vec::new(),
        }
    }

    /// Record one failure.
    pub fn push(&mut self, failure: CompensationFailure) {
        self.failures.push(failure);
    }

    /// Whether nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failed compensations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// `Ok(())` if nothing failed, otherwise the aggregate as an error.
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one compensation failed.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for CompensationFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} compensation(s) failed for transaction '{}'",
            self.failures.len(),
            self.transaction_id
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// Errors returned by the saga engine.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    /// The transaction id is not registered.
    #[error("Unknown transaction '{id}'")]
    UnknownTransaction {
        /// The id that was looked up
        id: TransactionId,
    },

    /// The requested phase is not valid given the transaction's state.
    #[error("Invalid phase {requested} for transaction '{id}' in state {current}")]
    InvalidPhase {
        /// The transaction
        id: TransactionId,
        /// Its state when the request was made
        current: TransactionState,
        /// The phase that was requested
        requested: Phase,
    },

    /// A payload could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Application handler code failed.
    #[error("Handler failed during {phase} of transaction '{id}': {failure}")]
    Handler {
        /// The transaction
        id: TransactionId,
        /// The phase being handled
        phase: Phase,
        /// The failure raised
        failure: HandlerFailure,
    },

    /// Compensation failed for at least one participant.
    #[error(transparent)]
    Compensation(#[from] CompensationFailures),

    /// No handler is registered for an event.
    #[error("No handler registered for {phase} with payload '{payload_type}'")]
    MissingHandler {
        /// The event's phase
        phase: Phase,
        /// The event's payload type tag (`<none>` for empty payloads)
        payload_type: String,
    },

    /// A handler registration is malformed or conflicts with another.
    #[error("Invalid handler registration: {0}")]
    InvalidRegistration(String),

    /// The event log failed.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// An operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What timed out
        operation: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// An operation was cancelled.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SagaError {
    /// The stable tag of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTransaction { .. } => ErrorKind::UnknownTransaction,
            Self::InvalidPhase { .. } => ErrorKind::InvalidPhase,
            Self::Encode(_) => ErrorKind::Encode,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Handler { .. } => ErrorKind::HandlerFailure,
            Self::Compensation(_) => ErrorKind::Compensation,
            Self::MissingHandler { .. } => ErrorKind::MissingHandler,
            Self::InvalidRegistration(_) => ErrorKind::InvalidRegistration,
            Self::EventLog(_) => ErrorKind::EventLog,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for [`SagaError::UnknownTransaction`].
    #[must_use]
    pub fn unknown(id: &TransactionId) -> Self {
        Self::UnknownTransaction { id: id.clone() }
    }
}

impl From<CodecError> for SagaError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(reason) => Self::Encode(reason),
            decode @ CodecError::Decode { .. } => Self::Decode(decode.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::failure::FailureKind;
    use crate::phase::Outcome;

    #[test]
    fn kinds_are_stable() {
        let err = SagaError::unknown(&"tx-9".into());
        assert_eq!(err.kind(), ErrorKind::UnknownTransaction);
        assert_eq!(err.kind().as_str(), "unknown_transaction");
        assert_eq!(err.to_string(), "Unknown transaction 'tx-9'");

        let err = SagaError::InvalidPhase {
            id: "tx-9".into(),
            current: TransactionState::Terminated(Outcome::Committed),
            requested: Phase::Join,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidPhase);
        assert!(err.to_string().contains("TERMINATED(COMMITTED)"));
    }

    #[test]
    fn codec_errors_convert() {
        let err: SagaError = CodecError::Encode("boom".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Encode);

        let err: SagaError = CodecError::Decode {
            target: "Order",
            reason: "eof".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn compensation_failures_aggregate() {
        let mut failures = CompensationFailures::new("tx-1".into());
        assert!(failures.clone().into_result().is_ok());

        failures.push(CompensationFailure {
            handler_id: "release-stock".to_string(),
            payload_type: None,
            failure: HandlerFailure::new(FailureKind::Unavailable, "warehouse down"),
            attempts: 1,
        });
        failures.push(CompensationFailure {
            handler_id: "refund".to_string(),
            payload_type: None,
            failure: HandlerFailure::internal("ledger locked"),
            attempts: 3,
        });

        assert_eq!(failures.len(), 2);
        let rendered = failures.to_string();
        assert!(rendered.starts_with("2 compensation(s) failed for transaction 'tx-1'"));
        assert!(rendered.contains("refund"));

        let err: SagaError = failures.into_result().unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Compensation);
    }
}
