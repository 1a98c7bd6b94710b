//! Dead-letter queue for compensations that could not be completed.
//!
//! When a compensating handler still fails after the configured
//! [`CompensationPolicy`](crate::config::CompensationPolicy), the rollback
//! carries on with the remaining participants and the failed compensation
//! is parked here. Operators inspect the queue, get notified through
//! [`DeadLetterListener`]s, and relay entries back to their handler once the
//! underlying problem is fixed.
//!
//! # Features
//!
//! - Bounded queue (oldest entry dropped when full)
//! - Thread-safe, cheap to clone
//! - Listener fan-out; a failing or panicking listener does not stop the others

use chrono::{DateTime, Utc};
use sagaflow_core::environment::{Clock, SystemClock};
use sagaflow_core::event::{SagaEvent, TransactionId};
use sagaflow_core::failure::HandlerFailure;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

/// A compensation to run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationTask {
    /// The rollback event as seen by the compensating handler.
    pub event: SagaEvent,
    /// Type tag used to resolve the compensating handler.
    pub payload_type: Option<String>,
    /// Id of the handler that failed.
    pub handler_id: String,
}

/// Dead letter queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter<T> {
    /// Unique id of the entry
    pub id: Uuid,
    /// The transaction being rolled back
    pub transaction_id: TransactionId,
    /// The failed operation
    pub payload: T,
    /// The last failure
    pub failure: HandlerFailure,
    /// Attempts made before giving up
    pub attempts: u32,
    /// When the entry was queued
    pub failed_at: DateTime<Utc>,
}

/// Notified whenever an entry is added to a [`DeadLetterQueue`].
pub trait DeadLetterListener<T>: Send + Sync {
    /// Handle a new dead letter.
    ///
    /// # Errors
    ///
    /// An error is logged; it never affects the queue or other listeners.
    fn on_dead_letter(&self, letter: &DeadLetter<T>) -> Result<(), HandlerFailure>;
}

type Listeners<T> = Arc<RwLock<Vec<Arc<dyn DeadLetterListener<T>>>>>;

/// Bounded dead letter queue.
///
/// # Example
///
/// ```
/// use sagaflow_core::failure::HandlerFailure;
/// use sagaflow_runtime::dead_letter::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(2);
/// dlq.push("tx-1".into(), "release stock", HandlerFailure::transient("warehouse down"), 1);
/// assert_eq!(dlq.len(), 1);
/// assert_eq!(dlq.pop_newest().map(|l| l.payload), Some("release stock"));
/// ```
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    listeners: Listeners<T>,
    clock: Arc<dyn Clock>,
    max_size: usize,
}

impl<T: Clone> DeadLetterQueue<T> {
    /// Create a new dead letter queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            clock: Arc::new(SystemClock),
            max_size: max_size.max(1),
        }
    }

    /// Stamp entries with `clock` instead of the system time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn DeadLetterListener<T>>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Queue a failed operation and notify listeners.
    ///
    /// If the queue is full, the oldest entry is dropped. Returns the id of
    /// the new entry.
    pub fn push(
        &self,
        transaction_id: TransactionId,
        payload: T,
        failure: HandlerFailure,
        attempts: u32,
    ) -> Uuid {
        let letter = DeadLetter {
            id: Uuid::new_v4(),
            transaction_id,
            payload,
            failure,
            attempts,
            failed_at: self.clock.now(),
        };
        let id = letter.id;

        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.max_size {
                queue.pop_front();
                tracing::warn!(max_size = self.max_size, "DLQ at capacity, dropping oldest entry");
            }
            queue.push_back(letter.clone());
            record_size(queue.len());
        }
        metrics::counter!("saga_dead_letters_total").increment(1);
        tracing::warn!(
            transaction_id = %letter.transaction_id,
            attempts,
            error = %letter.failure,
            "Compensation added to dead letter queue"
        );

        self.notify(&letter);
        id
    }

    /// Put an entry back after a failed relay, keeping its id.
    pub fn restore(&self, letter: DeadLetter<T>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.max_size {
            queue.pop_front();
        }
        queue.push_back(letter);
        record_size(queue.len());
    }

    /// Remove and return the newest entry.
    pub fn pop_newest(&self) -> Option<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let letter = queue.pop_back();
        record_size(queue.len());
        letter
    }

    /// Remove and return the entry with the given id.
    pub fn take(&self, id: Uuid) -> Option<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let position = queue.iter().position(|letter| letter.id == id)?;
        let letter = queue.remove(position);
        record_size(queue.len());
        letter
    }

    /// Copies of every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter<T>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Drain all entries from the queue.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        record_size(0);
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }

    /// Get the current queue size
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the maximum queue size
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    fn notify(&self, letter: &DeadLetter<T>) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_dead_letter(letter))) {
                Ok(Ok(())) => {},
                Ok(Err(failure)) => {
                    tracing::error!(
                        dead_letter = %letter.id,
                        error = %failure,
                        "Dead letter listener failed"
                    );
                },
                Err(_) => {
                    tracing::error!(dead_letter = %letter.id, "Dead letter listener panicked");
                },
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_size(size: usize) {
    metrics::gauge!("saga_dlq_size").set(size as f64);
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            listeners: Arc::clone(&self.listeners),
            clock: Arc::clone(&self.clock),
            max_size: self.max_size,
        }
    }
}

impl<T> std::fmt::Debug for DeadLetterQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}
