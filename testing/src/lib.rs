//! # Sagaflow Testing
//!
//! Testing utilities and helpers for the Sagaflow saga engine.
//!
//! This crate provides:
//! - An in-memory [`EventLog`](sagaflow_core::event_log::EventLog) with consumer groups
//!   and redelivery
//! - Mock implementations of environment traits
//! - A lifecycle observer that records notices for assertions
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use sagaflow_testing::{InMemoryEventLog, RecordingObserver};
//!
//! #[tokio::test]
//! async fn test_order_saga() {
//!     let log = Arc::new(InMemoryEventLog::new());
//!     let observer = Arc::new(RecordingObserver::new());
//!     let engine = SagaEngine::builder(log.clone())
//!         .with_observer(observer.clone())
//!         .register(start_handler())
//!         .build()
//!         .unwrap();
//!
//!     let id = engine.manager().start(&Order { id: 7 }).await.unwrap();
//!     assert!(log.wait_until(TOPIC, TIMEOUT, |events| events.len() == 3).await);
//! }
//! ```

use chrono::{DateTime, Utc};
use sagaflow_core::environment::{Clock, IdGenerator};
use sagaflow_core::event::TransactionId;

pub mod event_log;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, TransactionId, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use sagaflow_testing::mocks::FixedClock;
    /// use sagaflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Transaction ids `{prefix}-1`, `{prefix}-2`, ...
    ///
    /// ```
    /// use sagaflow_core::environment::IdGenerator;
    /// use sagaflow_testing::mocks::SequentialIdGenerator;
    ///
    /// let ids = SequentialIdGenerator::new("order");
    /// assert_eq!(ids.next_id().as_str(), "order-1");
    /// assert_eq!(ids.next_id().as_str(), "order-2");
    /// ```
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Start counting at 1.
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> TransactionId {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            TransactionId::new(format!("{}-{n}", self.prefix))
        }
    }
}

/// Lifecycle observers for assertions.
pub mod observer {
    use sagaflow_core::event::TransactionId;
    use sagaflow_runtime::observer::{LifecycleNotice, LifecycleObserver};
    use std::sync::{Mutex, PoisonError};

    /// Records every notice it receives.
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        notices: Mutex<Vec<LifecycleNotice>>,
    }

    impl RecordingObserver {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Everything recorded so far.
        #[must_use]
        pub fn notices(&self) -> Vec<LifecycleNotice> {
            self.notices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Notices for one transaction.
        #[must_use]
        pub fn notices_for(&self, id: &TransactionId) -> Vec<LifecycleNotice> {
            self.notices()
                .into_iter()
                .filter(|notice| notice.transaction_id() == id)
                .collect()
        }

        /// Number of recorded notices matching `predicate`.
        #[must_use]
        pub fn count(&self, predicate: impl Fn(&LifecycleNotice) -> bool) -> usize {
            self.notices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|notice| predicate(notice))
                .count()
        }
    }

    impl LifecycleObserver for RecordingObserver {
        fn notify(&self, notice: &LifecycleNotice) {
            self.notices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(notice.clone());
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a test-friendly tracing subscriber.
    ///
    /// Honors `RUST_LOG`. Safe to call from every test; only the first call
    /// installs anything.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use sagaflow_core::failure::FailureKind;
    use sagaflow_core::phase::Phase;

    /// Any lifecycle phase.
    pub fn any_phase() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Start),
            Just(Phase::Join),
            Just(Phase::Commit),
            Just(Phase::Rollback),
        ]
    }

    /// Any failure kind.
    pub fn any_failure_kind() -> impl Strategy<Value = FailureKind> {
        proptest::sample::select(FailureKind::ALL.to_vec())
    }
}

// Re-export commonly used items
pub use event_log::InMemoryEventLog;
pub use helpers::init_test_tracing;
pub use mocks::{FixedClock, SequentialIdGenerator, test_clock};
pub use observer::RecordingObserver;
