//! Lifecycle phases and transaction states.
//!
//! A transaction moves forward through `Start → Join* → Commit`, or is
//! diverted to `Rollback` from any non-terminal phase. Both `Commit` and
//! `Rollback` end in a [`TransactionState::Terminated`] state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The four lifecycle phases an event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// A transaction was opened.
    Start,
    /// A participant attached itself to the transaction.
    Join,
    /// The transaction should complete forward.
    Commit,
    /// The transaction should be compensated.
    Rollback,
}

impl Phase {
    /// Every phase, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Start, Self::Join, Self::Commit, Self::Rollback];

    /// Stable lowercase label, used for metrics and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Join => "join",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }

    /// Whether the phase is on the forward path (`Start`, `Join`, `Commit`).
    #[must_use]
    pub const fn is_forward(self) -> bool {
        !matches!(self, Self::Rollback)
    }

    /// Position on the forward path. `Rollback` ranks above everything.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Start => 0,
            Self::Join => 1,
            Self::Commit => 2,
            Self::Rollback => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Start => "START",
            Self::Join => "JOIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        };
        f.write_str(label)
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// The commit phase completed.
    Committed,
    /// The rollback phase completed (successfully or with compensation failures).
    RolledBack,
}

impl Outcome {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => f.write_str("COMMITTED"),
            Self::RolledBack => f.write_str("ROLLED_BACK"),
        }
    }
}

/// State of a transaction as seen by the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Still in flight; carries the latest phase requested for it.
    Active(Phase),
    /// Finished; no further events are processed.
    Terminated(Outcome),
}

impl TransactionState {
    /// Whether no further events may change this transaction.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated(_))
    }

    /// The current phase, if still active.
    #[must_use]
    pub const fn phase(self) -> Option<Phase> {
        match self {
            Self::Active(phase) => Some(phase),
            Self::Terminated(_) => None,
        }
    }

    /// Check that moving to `next` keeps the phase monotonic.
    ///
    /// Forward phases may repeat `Join` but never go backwards, `Start` and
    /// `Commit` may only be requested once, and `Rollback` is reachable from
    /// any non-terminal phase except itself.
    #[must_use]
    pub const fn allows(self, next: Phase) -> bool {
        match self {
            Self::Terminated(_) => false,
            Self::Active(Phase::Rollback) => false,
            Self::Active(_) if matches!(next, Phase::Rollback) => true,
            Self::Active(Phase::Start) => matches!(next, Phase::Join | Phase::Commit),
            Self::Active(Phase::Join) => matches!(next, Phase::Join | Phase::Commit),
            Self::Active(Phase::Commit) => false,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active(phase) => write!(f, "{phase}"),
            Self::Terminated(outcome) => write!(f, "TERMINATED({outcome})"),
        }
    }
}
