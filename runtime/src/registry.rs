//! Live transaction registry.
//!
//! Tracks every in-flight [`Transaction`] of this process, keyed by id, and
//! remembers a bounded number of recently terminated ones so late
//! duplicate deliveries can be told apart from unknown ids.
//!
//! Reads go through a sharded concurrent map; each transaction carries its
//! own short-lived lock that is never held across an `.await`.
//!
//! A transaction leaves the live map only when it completes or is evicted.
//! One whose `Start` never ran (dropped, or no handler registered) stays
//! live until [`TransactionRegistry::evict_idle`] removes it.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sagaflow_core::error::{CompensationFailures, SagaError};
use sagaflow_core::event::TransactionId;
use sagaflow_core::phase::{Outcome, Phase, TransactionState};
use sagaflow_core::transaction::Transaction;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Terminal result of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// How the transaction ended.
    pub outcome: Outcome,
    /// Compensations that failed during rollback, if any.
    pub compensation_failures: Option<CompensationFailures>,
}

impl Completion {
    /// A completion without compensation failures.
    #[must_use]
    pub const fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            compensation_failures: None,
        }
    }

    /// The outcome, or the aggregated compensation failures.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Compensation`] if any compensation failed.
    pub fn into_result(self) -> Result<Outcome, SagaError> {
        match self.compensation_failures {
            Some(failures) if !failures.is_empty() => Err(SagaError::Compensation(failures)),
            _ => Ok(self.outcome),
        }
    }
}

/// One live transaction plus its completion signal.
#[derive(Debug)]
pub struct TransactionSlot {
    transaction: Mutex<Transaction>,
    completion: watch::Sender<Option<Completion>>,
    touched: Mutex<Instant>,
}

impl TransactionSlot {
    fn new(transaction: Transaction) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            transaction: Mutex::new(transaction),
            completion,
            touched: Mutex::new(Instant::now()),
        }
    }

    /// Run `f` with exclusive access to the transaction.
    pub fn with<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> R {
        let mut transaction = self.transaction.lock().unwrap_or_else(PoisonError::into_inner);
        *self.touched.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        f(&mut transaction)
    }

    /// Time since the transaction was last accessed.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.touched.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }

    /// A copy of the transaction's current state.
    #[must_use]
    pub fn snapshot(&self) -> Transaction {
        self.with(|tx| tx.clone())
    }

    /// Receiver resolving once the transaction completes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Completion>> {
        self.completion.subscribe()
    }
}

/// Result of looking up a transaction id.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// The transaction is in flight.
    Live(Arc<TransactionSlot>),
    /// The transaction ended recently.
    Terminated(Completion),
    /// Neither live nor recently terminated.
    Unknown,
}

#[derive(Debug)]
struct TerminatedCache {
    capacity: usize,
    order: VecDeque<TransactionId>,
    entries: HashMap<TransactionId, Completion>,
}

impl TerminatedCache {
    fn insert(&mut self, id: TransactionId, completion: Completion) {
        if self.entries.insert(id.clone(), completion).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

/// Concurrent map of live transactions.
#[derive(Debug)]
pub struct TransactionRegistry {
    live: DashMap<TransactionId, Arc<TransactionSlot>>,
    terminated: Mutex<TerminatedCache>,
}

impl TransactionRegistry {
    /// Create a registry remembering up to `terminated_capacity` finished
    /// transactions.
    #[must_use]
    pub fn new(terminated_capacity: usize) -> Self {
        Self {
            live: DashMap::new(),
            terminated: Mutex::new(TerminatedCache {
                capacity: terminated_capacity.max(1),
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Register a freshly opened transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::InvalidPhase`] if the id is already live or
    /// recently terminated.
    pub fn open(&self, transaction: Transaction) -> Result<Arc<TransactionSlot>, SagaError> {
        if let Some(completion) = self.terminated_completion(&transaction.id) {
            return Err(SagaError::InvalidPhase {
                id: transaction.id,
                current: TransactionState::Terminated(completion.outcome),
                requested: Phase::Start,
            });
        }

        match self.live.entry(transaction.id.clone()) {
            Entry::Occupied(existing) => Err(SagaError::InvalidPhase {
                id: transaction.id,
                current: existing.get().with(|tx| tx.state),
                requested: Phase::Start,
            }),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(TransactionSlot::new(transaction));
                vacant.insert(Arc::clone(&slot));
                metrics::gauge!("saga_transactions_live").increment(1.0);
                Ok(slot)
            },
        }
    }

    /// Register `transaction` unless its id is already known.
    ///
    /// Returns the live slot (new or existing), or `None` if the id
    /// terminated recently.
    pub fn open_if_absent(&self, transaction: Transaction) -> Option<Arc<TransactionSlot>> {
        if self.terminated_completion(&transaction.id).is_some() {
            return None;
        }
        let mut created = false;
        let entry = self.live.entry(transaction.id.clone()).or_insert_with(|| {
            created = true;
            Arc::new(TransactionSlot::new(transaction))
        });
        let slot = Arc::clone(entry.value());
        drop(entry);
        if created {
            metrics::gauge!("saga_transactions_live").increment(1.0);
        }
        Some(slot)
    }

    /// Look up a transaction id.
    #[must_use]
    pub fn lookup(&self, id: &TransactionId) -> Lookup {
        if let Some(slot) = self.live.get(id) {
            return Lookup::Live(Arc::clone(slot.value()));
        }
        self.terminated_completion(id)
            .map_or(Lookup::Unknown, Lookup::Terminated)
    }

    /// The live slot of a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::InvalidPhase`] for a recently terminated
    /// transaction and [`SagaError::UnknownTransaction`] otherwise.
    pub fn live_slot(
        &self,
        id: &TransactionId,
        requested: Phase,
    ) -> Result<Arc<TransactionSlot>, SagaError> {
        match self.lookup(id) {
            Lookup::Live(slot) => Ok(slot),
            Lookup::Terminated(completion) => Err(SagaError::InvalidPhase {
                id: id.clone(),
                current: TransactionState::Terminated(completion.outcome),
                requested,
            }),
            Lookup::Unknown => Err(SagaError::unknown(id)),
        }
    }

    /// Current state of a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::UnknownTransaction`] if the id is neither live
    /// nor recently terminated.
    pub fn state(&self, id: &TransactionId) -> Result<TransactionState, SagaError> {
        match self.lookup(id) {
            Lookup::Live(slot) => Ok(slot.with(|tx| tx.state)),
            Lookup::Terminated(completion) => Ok(TransactionState::Terminated(completion.outcome)),
            Lookup::Unknown => Err(SagaError::unknown(id)),
        }
    }

    /// Receiver resolving once the transaction completes.
    ///
    /// For a recently terminated transaction the receiver already holds the
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::UnknownTransaction`] for unknown ids.
    pub fn subscribe(
        &self,
        id: &TransactionId,
    ) -> Result<watch::Receiver<Option<Completion>>, SagaError> {
        match self.lookup(id) {
            Lookup::Live(slot) => Ok(slot.subscribe()),
            Lookup::Terminated(completion) => Ok(watch::channel(Some(completion)).1),
            Lookup::Unknown => Err(SagaError::unknown(id)),
        }
    }

    /// Move a transaction from the live map to the terminated cache and wake
    /// every waiter.
    pub fn complete(&self, id: &TransactionId, completion: Completion) {
        self.terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), completion.clone());

        if let Some((_, slot)) = self.live.remove(id) {
            slot.with(|tx| tx.terminate(completion.outcome));
            slot.completion.send_replace(Some(completion));
            metrics::gauge!("saga_transactions_live").decrement(1.0);
        }
    }

    /// Forget a live transaction without recording a completion.
    ///
    /// Used when the event that would have opened it never reached the log.
    pub fn discard(&self, id: &TransactionId) {
        if self.live.remove(id).is_some() {
            metrics::gauge!("saga_transactions_live").decrement(1.0);
        }
    }

    /// Drop live transactions untouched for at least `max_idle`.
    ///
    /// Evicted transactions are not recorded as terminated; their waiters
    /// observe a discarded transaction. Returns the evicted ids.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<TransactionId> {
        let idle: Vec<TransactionId> = self
            .live
            .iter()
            .filter(|entry| entry.value().idle_for() >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(idle.len());
        for id in idle {
            if self
                .live
                .remove_if(&id, |_, slot| slot.idle_for() >= max_idle)
                .is_some()
            {
                metrics::gauge!("saga_transactions_live").decrement(1.0);
                tracing::warn!(transaction_id = %id, "Evicted idle transaction");
                evicted.push(id);
            }
        }
        evicted
    }

    /// Whether the id terminated recently.
    #[must_use]
    pub fn is_recently_terminated(&self, id: &TransactionId) -> bool {
        self.terminated_completion(id).is_some()
    }

    /// Number of live transactions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn terminated_completion(&self, id: &TransactionId) -> Option<Completion> {
        self.terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .cloned()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new(10_000)
    }
}
