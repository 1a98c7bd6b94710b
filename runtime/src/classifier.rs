//! Failure classification.
//!
//! Every handler registration carries two independent exclusion sets:
//!
//! - `retry_exclusions`: kinds that must not be redelivered
//! - `rollback_exclusions`: kinds that must not trigger compensation
//!
//! A failure is first considered for redelivery; once it cannot (or may
//! not) be retried it escalates, either to a rollback or, if excluded from
//! rollback, to being logged and dropped.

use sagaflow_core::failure::{FailureKindSet, HandlerFailure};
use std::fmt;

/// Result of matching a failure against one exclusion set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The failure kind is not excluded.
    Retryable,
    /// The failure kind (or an ancestor) is excluded.
    Skip,
}

/// What the dispatcher does with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureDisposition {
    /// Leave the delivery unacknowledged so the log redelivers it.
    Redeliver,
    /// Append a `Rollback` event for the transaction.
    Rollback,
    /// Acknowledge and forget; no compensation.
    Drop,
}

impl FailureDisposition {
    /// Stable label for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Redeliver => "redeliver",
            Self::Rollback => "rollback",
            Self::Drop => "drop",
        }
    }
}

impl fmt::Display for FailureDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides between redelivery, rollback and dropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryClassifier {
    max_attempts: u32,
}

impl RetryClassifier {
    /// Create a classifier allowing `max_attempts` deliveries per event.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Deliveries allowed per event.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Match a failure against an exclusion set.
    ///
    /// The failure is [`Classification::Skip`] if its kind, or any ancestor
    /// kind, is in `exclusions`.
    #[must_use]
    pub fn classify(failure: &HandlerFailure, exclusions: &FailureKindSet) -> Classification {
        if exclusions.covers(failure.kind) {
            Classification::Skip
        } else {
            Classification::Retryable
        }
    }

    /// Decide what to do with a failure raised on delivery number `attempt`
    /// (1-based).
    #[must_use]
    pub fn disposition(
        &self,
        failure: &HandlerFailure,
        retry_exclusions: &FailureKindSet,
        rollback_exclusions: &FailureKindSet,
        attempt: u32,
    ) -> FailureDisposition {
        let retryable = Self::classify(failure, retry_exclusions) == Classification::Retryable;
        if retryable && attempt < self.max_attempts {
            return FailureDisposition::Redeliver;
        }

        match Self::classify(failure, rollback_exclusions) {
            Classification::Skip => FailureDisposition::Drop,
            Classification::Retryable => FailureDisposition::Rollback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sagaflow_core::failure::FailureKind;

    #[test]
    fn empty_sets_retry_then_roll_back() {
        let classifier = RetryClassifier::new(3);
        let failure = HandlerFailure::validation("negative amount");
        let none = FailureKindSet::new();

        let decide = |attempt| classifier.disposition(&failure, &none, &none, attempt);

        assert_eq!(decide(1), FailureDisposition::Redeliver);
        assert_eq!(decide(2), FailureDisposition::Redeliver);
        assert_eq!(decide(3), FailureDisposition::Rollback);
    }

    #[test]
    fn retry_exclusion_escalates_immediately() {
        let classifier = RetryClassifier::new(3);
        let failure = HandlerFailure::validation("negative amount");
        let no_retry = FailureKindSet::of([FailureKind::Rejected]);

        assert_eq!(
            classifier.disposition(&failure, &no_retry, &FailureKindSet::new(), 1),
            FailureDisposition::Rollback
        );
    }

    #[test]
    fn rollback_exclusion_drops_after_retries() {
        let classifier = RetryClassifier::new(2);
        let failure = HandlerFailure::new(FailureKind::Decode, "bad bytes");
        let no_rollback = FailureKindSet::of([FailureKind::Codec]);
        let none = FailureKindSet::new();

        let decide = |retry: &FailureKindSet, attempt| {
            classifier.disposition(&failure, retry, &no_rollback, attempt)
        };

        assert_eq!(decide(&none, 1), FailureDisposition::Redeliver);
        assert_eq!(decide(&none, 2), FailureDisposition::Drop);
        assert_eq!(decide(&no_rollback, 1), FailureDisposition::Drop);
    }

    #[test]
    fn classify_walks_ancestors() {
        let transient = FailureKindSet::of([FailureKind::Transient]);
        assert_eq!(
            RetryClassifier::classify(&HandlerFailure::timeout("slow"), &transient),
            Classification::Skip
        );
        assert_eq!(
            RetryClassifier::classify(&HandlerFailure::internal("boom"), &transient),
            Classification::Retryable
        );
    }

    fn any_kind() -> impl Strategy<Value = FailureKind> {
        proptest::sample::select(FailureKind::ALL.to_vec())
    }

    fn any_set() -> impl Strategy<Value = FailureKindSet> {
        proptest::collection::vec(any_kind(), 0..4).prop_map(FailureKindSet::of)
    }

    proptest! {
        #[test]
        fn rollback_excluded_failures_never_roll_back(
            kind in any_kind(),
            retry in any_set(),
            mut rollback in any_set(),
            attempt in 1u32..10,
        ) {
            rollback.insert(kind);
            let failure = HandlerFailure::new(kind, "excluded");
            let disposition =
                RetryClassifier::new(3).disposition(&failure, &retry, &rollback, attempt);
            prop_assert_ne!(disposition, FailureDisposition::Rollback);
        }

        #[test]
        fn exhausted_attempts_never_redeliver(
            kind in any_kind(),
            retry in any_set(),
            rollback in any_set(),
            max in 1u32..5,
        ) {
            let failure = HandlerFailure::new(kind, "late");
            let disposition =
                RetryClassifier::new(max).disposition(&failure, &retry, &rollback, max);
            prop_assert_ne!(disposition, FailureDisposition::Redeliver);
        }
    }
}
