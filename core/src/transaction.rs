//! Per-transaction bookkeeping.
//!
//! A [`Transaction`] is created on `start`, advanced by the dispatcher as
//! events are processed, and terminal once committed or rolled back. Each
//! successfully processed `Join` appends a [`ParticipantRecord`]; records
//! are consumed in reverse join order during rollback.

use crate::error::SagaError;
use crate::event::{EventId, TransactionId};
use crate::payload::EncodedPayload;
use crate::phase::{Outcome, Phase, TransactionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A participant that joined a transaction and must be compensated on rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Id of the handler that processed the join.
    pub handler_id: String,
    /// Type tag of the join payload; selects the compensating handler.
    pub payload_type: Option<String>,
    /// The last phase this participant processed.
    pub last_phase_processed: Phase,
    /// Data replayed to the compensating handler.
    pub undo_payload: Option<EncodedPayload>,
    /// When the join was processed.
    pub joined_at: DateTime<Utc>,
}

/// State of one saga instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction identifier.
    pub id: TransactionId,
    /// Current lifecycle state.
    pub state: TransactionState,
    /// When the transaction was opened.
    pub created_at: DateTime<Utc>,
    /// Joined participants, in join order.
    pub participants: Vec<ParticipantRecord>,
    /// Latest phase whose event finished processing.
    pub last_phase_processed: Option<Phase>,
    processed_events: HashSet<EventId>,
}

impl Transaction {
    /// Open a new transaction in the `Start` phase.
    #[must_use]
    pub fn new(id: TransactionId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: TransactionState::Active(Phase::Start),
            created_at,
            participants: Vec::new(),
            last_phase_processed: None,
            processed_events: HashSet::new(),
        }
    }

    /// Rebuild a transaction this node never saw start, already in `phase`.
    ///
    /// Used when a follow-up event outlives the process that opened the
    /// transaction. Participants recorded by that process are not known.
    #[must_use]
    pub fn resumed(id: TransactionId, phase: Phase, created_at: DateTime<Utc>) -> Self {
        Self {
            state: TransactionState::Active(phase),
            last_phase_processed: Some(Phase::Start),
            ..Self::new(id, created_at)
        }
    }

    /// The current phase, or `None` once terminated.
    #[must_use]
    pub const fn phase(&self) -> Option<Phase> {
        self.state.phase()
    }

    /// Whether the transaction has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a rollback has been requested.
    #[must_use]
    pub const fn is_rolling_back(&self) -> bool {
        matches!(self.state, TransactionState::Active(Phase::Rollback))
    }

    /// Move to `next`, enforcing the monotonic phase order.
    ///
    /// Returns the previous state so the caller can restore it if the
    /// matching event never makes it into the log.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::InvalidPhase`] if the transaction is terminal or
    /// `next` would move the phase backwards.
    pub fn advance_to(&mut self, next: Phase) -> Result<TransactionState, SagaError> {
        if !self.state.allows(next) {
            return Err(SagaError::InvalidPhase {
                id: self.id.clone(),
                current: self.state,
                requested: next,
            });
        }
        let previous = self.state;
        self.state = TransactionState::Active(next);
        Ok(previous)
    }

    /// Restore a state returned by [`advance_to`](Self::advance_to), unless
    /// something else moved the transaction on in the meantime.
    pub fn restore(&mut self, requested: Phase, previous: TransactionState) {
        if self.state == TransactionState::Active(requested) {
            self.state = previous;
        }
    }

    /// Note that an event of `phase` finished processing.
    ///
    /// Events appended by another node are observed here first, so the
    /// recorded phase catches up with the log.
    pub fn record_processed(&mut self, event_id: EventId, phase: Phase) {
        self.processed_events.insert(event_id);
        self.last_phase_processed = Some(phase);
        if let TransactionState::Active(current) = self.state {
            if phase.rank() > current.rank() {
                self.state = TransactionState::Active(phase);
            }
        }
    }

    /// Whether the event already finished processing.
    #[must_use]
    pub fn has_processed(&self, event_id: &EventId) -> bool {
        self.processed_events.contains(event_id)
    }

    /// Append a participant record.
    pub fn add_participant(&mut self, record: ParticipantRecord) {
        self.participants.push(record);
    }

    /// Mark the transaction terminated.
    pub fn terminate(&mut self, outcome: Outcome) {
        self.state = TransactionState::Terminated(outcome);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn transaction() -> Transaction {
        Transaction::new("tx-1".into(), Utc::now())
    }

    #[test]
    fn new_transaction_starts_in_start() {
        let tx = transaction();
        assert_eq!(tx.phase(), Some(Phase::Start));
        assert!(tx.participants.is_empty());
        assert!(tx.last_phase_processed.is_none());
    }

    #[test]
    fn advance_rejects_backwards_and_terminal() {
        let mut tx = transaction();
        tx.advance_to(Phase::Join).unwrap();
        tx.advance_to(Phase::Join).unwrap();
        tx.advance_to(Phase::Commit).unwrap();

        let err = tx.advance_to(Phase::Join).unwrap_err();
        assert!(matches!(err, SagaError::InvalidPhase { requested: Phase::Join, .. }));

        tx.terminate(Outcome::Committed);
        assert!(tx.advance_to(Phase::Rollback).is_err());
    }

    #[test]
    fn restore_only_undoes_own_change() {
        let mut tx = transaction();
        let previous = tx.advance_to(Phase::Join).unwrap();
        tx.restore(Phase::Join, previous);
        assert_eq!(tx.phase(), Some(Phase::Start));

        let previous = tx.advance_to(Phase::Join).unwrap();
        tx.advance_to(Phase::Rollback).unwrap();
        tx.restore(Phase::Join, previous);
        assert!(tx.is_rolling_back());
    }

    #[test]
    fn resumed_transaction_continues_from_its_phase() {
        let mut tx = Transaction::resumed("tx-9".into(), Phase::Join, Utc::now());

        assert_eq!(tx.phase(), Some(Phase::Join));
        assert!(tx.participants.is_empty());
        tx.advance_to(Phase::Commit).unwrap();

        let mut rolling = Transaction::resumed("tx-10".into(), Phase::Rollback, Utc::now());
        assert!(rolling.is_rolling_back());
        assert!(rolling.advance_to(Phase::Join).is_err());
    }

    #[test]
    fn processing_remote_events_catches_up_phase() {
        let mut tx = transaction();
        let event = EventId::new();
        tx.record_processed(event, Phase::Join);

        assert!(tx.has_processed(&event));
        assert_eq!(tx.phase(), Some(Phase::Join));
        assert_eq!(tx.last_phase_processed, Some(Phase::Join));
    }
}
