//! Failure taxonomy for handler code.
//!
//! Handlers report failures as a [`HandlerFailure`], tagged with a closed
//! [`FailureKind`]. Kinds form a shallow hierarchy so that an exclusion
//! set containing a parent kind (for example [`FailureKind::Transient`])
//! also covers its children ([`FailureKind::Timeout`],
//! [`FailureKind::Unavailable`]).
//!
//! ```text
//! Transient ── Timeout
//!           └─ Unavailable
//! Rejected  ── Validation
//!           ├─ Conflict
//!           └─ NotFound
//! Codec     ── Decode
//!           └─ Encode
//! Internal
//! ```

use crate::codec::CodecError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Closed set of failure kinds a handler can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A condition expected to clear up on its own.
    Transient,
    /// An operation did not finish within its bound.
    Timeout,
    /// A dependency could not be reached.
    Unavailable,
    /// The request was refused by business rules.
    Rejected,
    /// Input failed validation.
    Validation,
    /// The request conflicts with current state.
    Conflict,
    /// A referenced entity does not exist.
    NotFound,
    /// Payload encoding or decoding went wrong.
    Codec,
    /// A payload could not be decoded.
    Decode,
    /// A payload could not be encoded.
    Encode,
    /// Anything else.
    Internal,
}

impl FailureKind {
    /// Every kind, parents first.
    pub const ALL: [Self; 11] = [
        Self::Transient,
        Self::Timeout,
        Self::Unavailable,
        Self::Rejected,
        Self::Validation,
        Self::Conflict,
        Self::NotFound,
        Self::Codec,
        Self::Decode,
        Self::Encode,
        Self::Internal,
    ];

    /// The enclosing kind, if any.
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Timeout | Self::Unavailable => Some(Self::Transient),
            Self::Validation | Self::Conflict | Self::NotFound => Some(Self::Rejected),
            Self::Decode | Self::Encode => Some(Self::Codec),
            Self::Transient | Self::Rejected | Self::Codec | Self::Internal => None,
        }
    }

    /// This kind followed by each of its ancestors.
    pub fn lineage(self) -> impl Iterator<Item = Self> {
        std::iter::successors(Some(self), |kind| kind.parent())
    }

    /// Whether `self` is `other` or one of its descendants.
    #[must_use]
    pub fn is_a(self, other: Self) -> bool {
        self.lineage().any(|kind| kind == other)
    }

    /// Stable snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Codec => "codec",
            Self::Decode => "decode",
            Self::Encode => "encode",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of failure kinds, matched hierarchically.
///
/// # Example
///
/// ```
/// use sagaflow_core::failure::{FailureKind, FailureKindSet};
///
/// let set = FailureKindSet::of([FailureKind::Rejected]);
/// assert!(set.covers(FailureKind::Validation));
/// assert!(!set.covers(FailureKind::Timeout));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureKindSet {
    kinds: BTreeSet<FailureKind>,
}

impl FailureKindSet {
    /// An empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kinds: BTreeSet::new(),
        }
    }

    /// A set holding the given kinds.
    #[must_use]
    pub fn of(kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        kinds.into_iter().collect()
    }

    /// Add a kind.
    pub fn insert(&mut self, kind: FailureKind) {
        self.kinds.insert(kind);
    }

    /// Whether `kind` or one of its ancestors is in the set.
    #[must_use]
    pub fn covers(&self, kind: FailureKind) -> bool {
        kind.lineage().any(|k| self.kinds.contains(&k))
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Iterate the kinds stored in the set.
    pub fn iter(&self) -> impl Iterator<Item = FailureKind> + '_ {
        self.kinds.iter().copied()
    }
}

impl FromIterator<FailureKind> for FailureKindSet {
    fn from_iter<I: IntoIterator<Item = FailureKind>>(iter: I) -> Self {
        Self {
            kinds: iter.into_iter().collect(),
        }
    }
}

impl Extend<FailureKind> for FailureKindSet {
    fn extend<I: IntoIterator<Item = FailureKind>>(&mut self, iter: I) {
        self.kinds.extend(iter);
    }
}

/// A failure raised by application handler code.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct HandlerFailure {
    /// Classification used by retry and rollback decisions.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
}

impl HandlerFailure {
    /// Create a failure of the given kind.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A [`FailureKind::Transient`] failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// A [`FailureKind::Timeout`] failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// A [`FailureKind::Rejected`] failure.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }

    /// A [`FailureKind::Validation`] failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// A [`FailureKind::Internal`] failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl From<CodecError> for HandlerFailure {
    fn from(err: CodecError) -> Self {
        let kind = match err {
            CodecError::Encode(_) => FailureKind::Encode,
            CodecError::Decode { .. } => FailureKind::Decode,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lineage_walks_to_root() {
        let lineage: Vec<_> = FailureKind::Timeout.lineage().collect();
        assert_eq!(lineage, vec![FailureKind::Timeout, FailureKind::Transient]);
        assert_eq!(FailureKind::Internal.lineage().count(), 1);
    }

    #[test]
    fn set_covers_children_not_parents() {
        let set = FailureKindSet::of([FailureKind::Validation]);

        assert!(set.covers(FailureKind::Validation));
        assert!(!set.covers(FailureKind::Rejected));
        assert!(!set.covers(FailureKind::Conflict));
    }

    #[test]
    fn codec_errors_map_to_codec_kinds() {
        let decode: HandlerFailure = CodecError::Decode {
            target: "Order",
            reason: "bad".to_string(),
        }
        .into();
        assert_eq!(decode.kind, FailureKind::Decode);
        assert!(decode.kind.is_a(FailureKind::Codec));

        let encode: HandlerFailure = CodecError::Encode("bad".to_string()).into();
        assert_eq!(encode.kind, FailureKind::Encode);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let failure = HandlerFailure::validation("amount must be positive");
        assert_eq!(failure.to_string(), "validation: amount must be positive");
    }

    fn any_kind() -> impl Strategy<Value = FailureKind> {
        proptest::sample::select(FailureKind::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn covers_matches_lineage(
            kinds in proptest::collection::vec(any_kind(), 0..5),
            candidate in any_kind(),
        ) {
            let set = FailureKindSet::of(kinds.iter().copied());
            let expected = kinds.iter().any(|k| candidate.is_a(*k));
            prop_assert_eq!(set.covers(candidate), expected);
        }

        #[test]
        fn empty_set_covers_nothing(candidate in any_kind()) {
            prop_assert!(!FailureKindSet::new().covers(candidate));
        }
    }
}
