//! Client-facing saga manager.
//!
//! [`SagaManager`] is how application code starts transactions and drives
//! them through the lifecycle by hand. Every call validates the requested
//! phase against the [`TransactionRegistry`], appends exactly one event to
//! the log, and only returns once the log acknowledged the append.
//!
//! The `*_deferred` variants encode and validate synchronously, then hand
//! back an [`AppendHandle`] that resolves once the append completes.
//!
//! # Example
//!
//! ```ignore
//! let id = manager.start(&Order { id: 7 }).await?;
//! let stock = ReserveStock { sku: "A-1".into() };
//! manager.join(&id, &ReleaseStock { sku: "A-1".into() }, &stock).await?;
//! manager.commit(&id).await?;
//! assert_eq!(manager.await_completion(&id, Duration::from_secs(5)).await?, Outcome::Committed);
//! ```

use crate::config::EngineConfig;
use crate::metrics::TransactionMetrics;
use crate::observer::{LifecycleNotice, LifecycleObserver};
use crate::registry::{TransactionRegistry, TransactionSlot};
use sagaflow_core::environment::{Clock, IdGenerator};
use sagaflow_core::error::SagaError;
use sagaflow_core::event::{SagaEvent, TransactionId};
use sagaflow_core::event_log::EventLog;
use sagaflow_core::payload::{EncodedPayload, Payload};
use sagaflow_core::phase::{Outcome, Phase, TransactionState};
use sagaflow_core::transaction::Transaction;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

struct ManagerInner {
    log: Arc<dyn EventLog>,
    registry: Arc<TransactionRegistry>,
    config: EngineConfig,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn LifecycleObserver>,
}

/// Starts, joins, commits and rolls back transactions.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct SagaManager {
    inner: Arc<ManagerInner>,
}

/// A prepared event waiting to be appended.
struct Pending {
    slot: Arc<TransactionSlot>,
    event: SagaEvent,
    previous: Option<TransactionState>,
}

impl SagaManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        registry: Arc<TransactionRegistry>,
        config: EngineConfig,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                log,
                registry,
                config,
                ids,
                clock,
                observer,
            }),
        }
    }

    /// Open a transaction and append its `Start` event.
    ///
    /// # Errors
    ///
    /// - [`SagaError::Encode`] if the payload cannot be encoded
    /// - [`SagaError::EventLog`] if the append failed
    pub async fn start<T: Payload>(&self, payload: &T) -> Result<TransactionId, SagaError> {
        let payload = self.encode(payload)?;
        self.start_encoded(Some(payload)).await
    }

    /// Open a transaction whose `Start` event carries no payload.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::EventLog`] if the append failed.
    pub async fn start_empty(&self) -> Result<TransactionId, SagaError> {
        self.start_encoded(None).await
    }

    /// Append a `Join` event with the participant's undo data.
    ///
    /// # Errors
    ///
    /// - [`SagaError::UnknownTransaction`] if the id is not registered
    /// - [`SagaError::InvalidPhase`] if the transaction is terminal or rolling back
    /// - [`SagaError::Encode`] if a payload cannot be encoded
    /// - [`SagaError::EventLog`] if the append failed
    pub async fn join<U: Payload, T: Payload>(
        &self,
        id: &TransactionId,
        undo: &U,
        payload: &T,
    ) -> Result<(), SagaError> {
        let pending = self.prepare_join(id, undo, payload)?;
        self.publish(pending).await
    }

    /// Append a `Commit` event without payload.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join).
    pub async fn commit(&self, id: &TransactionId) -> Result<(), SagaError> {
        let pending = self.prepare(id, Phase::Commit, None, None, None)?;
        self.publish(pending).await
    }

    /// Append a `Commit` event carrying `payload`.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join).
    pub async fn commit_with<T: Payload>(
        &self,
        id: &TransactionId,
        payload: &T,
    ) -> Result<(), SagaError> {
        let pending = self.prepare(id, Phase::Commit, Some(self.encode(payload)?), None, None)?;
        self.publish(pending).await
    }

    /// Append a `Rollback` event with a human-readable cause.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join).
    pub async fn rollback(
        &self,
        id: &TransactionId,
        cause: impl Into<String>,
    ) -> Result<(), SagaError> {
        let pending = self.prepare(id, Phase::Rollback, None, None, Some(cause.into()))?;
        self.publish(pending).await
    }

    /// Append a `Rollback` event carrying a cause and a payload.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join).
    pub async fn rollback_with<T: Payload>(
        &self,
        id: &TransactionId,
        cause: impl Into<String>,
        payload: &T,
    ) -> Result<(), SagaError> {
        let payload = self.encode(payload)?;
        let pending = self.prepare(id, Phase::Rollback, Some(payload), None, Some(cause.into()))?;
        self.publish(pending).await
    }

    /// Like [`start`](Self::start), resolving the append in the background.
    ///
    /// The id is allocated and the payload encoded before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Encode`] immediately if the payload cannot be encoded.
    pub fn start_deferred<T: Payload>(
        &self,
        payload: &T,
    ) -> Result<AppendHandle<TransactionId>, SagaError> {
        let pending = self.open(Some(self.encode(payload)?))?;
        let manager = self.clone();
        Ok(AppendHandle::spawn(async move {
            let id = pending.event.transaction_id.clone();
            manager.publish_start(pending).await?;
            Ok(id)
        }))
    }

    /// Like [`join`](Self::join), resolving the append in the background.
    ///
    /// # Errors
    ///
    /// Validation and encoding errors are returned immediately.
    pub fn join_deferred<U: Payload, T: Payload>(
        &self,
        id: &TransactionId,
        undo: &U,
        payload: &T,
    ) -> Result<AppendHandle<()>, SagaError> {
        let pending = self.prepare_join(id, undo, payload)?;
        Ok(self.defer(pending))
    }

    /// Like [`commit`](Self::commit), resolving the append in the background.
    ///
    /// # Errors
    ///
    /// Validation errors are returned immediately.
    pub fn commit_deferred(&self, id: &TransactionId) -> Result<AppendHandle<()>, SagaError> {
        let pending = self.prepare(id, Phase::Commit, None, None, None)?;
        Ok(self.defer(pending))
    }

    /// Like [`rollback`](Self::rollback), resolving the append in the background.
    ///
    /// # Errors
    ///
    /// Validation errors are returned immediately.
    pub fn rollback_deferred(
        &self,
        id: &TransactionId,
        cause: impl Into<String>,
    ) -> Result<AppendHandle<()>, SagaError> {
        let pending = self.prepare(id, Phase::Rollback, None, None, Some(cause.into()))?;
        Ok(self.defer(pending))
    }

    /// Current state of a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::UnknownTransaction`] if the id is neither live
    /// nor recently terminated.
    pub fn exists(&self, id: &TransactionId) -> Result<TransactionState, SagaError> {
        self.inner.registry.state(id)
    }

    /// Evict live transactions idle for at least `max_idle`.
    ///
    /// Covers transactions that can never progress, such as one whose
    /// `Start` had no handler. Returns the evicted ids.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<TransactionId> {
        self.inner.registry.evict_idle(max_idle)
    }

    /// Wait until the transaction terminates.
    ///
    /// # Errors
    ///
    /// - [`SagaError::UnknownTransaction`] for unknown ids
    /// - [`SagaError::Compensation`] if it rolled back with failed compensations
    /// - [`SagaError::Timeout`] if it did not terminate within `timeout`
    pub async fn await_completion(
        &self,
        id: &TransactionId,
        timeout: Duration,
    ) -> Result<Outcome, SagaError> {
        let mut receiver = self.inner.registry.subscribe(id)?;
        let waited = tokio::time::timeout(timeout, receiver.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(completion)) => match completion.clone() {
                Some(completion) => completion.into_result(),
                None => Err(SagaError::Internal(format!("completion of '{id}' missing"))),
            },
            Ok(Err(_)) => Err(SagaError::Internal(format!(
                "transaction '{id}' was discarded before completing"
            ))),
            Err(_) => Err(SagaError::Timeout {
                operation: format!("waiting for transaction '{id}'"),
                after: timeout,
            }),
        }
    }

    async fn start_encoded(
        &self,
        payload: Option<EncodedPayload>,
    ) -> Result<TransactionId, SagaError> {
        let pending = self.open(payload)?;
        let id = pending.event.transaction_id.clone();
        self.publish_start(pending).await?;
        Ok(id)
    }

    fn open(&self, payload: Option<EncodedPayload>) -> Result<Pending, SagaError> {
        let id = self.inner.ids.next_id();
        let now = self.inner.clock.now();
        let slot = self.inner.registry.open(Transaction::new(id.clone(), now))?;
        let event = self.event(id, Phase::Start).with_payload(payload);
        Ok(Pending {
            slot,
            event,
            previous: None,
        })
    }

    async fn publish_start(&self, pending: Pending) -> Result<(), SagaError> {
        let id = pending.event.transaction_id.clone();
        if let Err(err) = self.append(&pending.event).await {
            self.inner.registry.discard(&id);
            return Err(err);
        }
        TransactionMetrics::record_started();
        tracing::info!(transaction_id = %id, "Transaction started");
        self.inner
            .observer
            .notify(&LifecycleNotice::Started { transaction_id: id });
        Ok(())
    }

    fn prepare_join<U: Payload, T: Payload>(
        &self,
        id: &TransactionId,
        undo: &U,
        payload: &T,
    ) -> Result<Pending, SagaError> {
        let undo = self.encode(undo)?;
        let payload = self.encode(payload)?;
        self.prepare(id, Phase::Join, Some(payload), Some(undo), None)
    }

    fn prepare(
        &self,
        id: &TransactionId,
        phase: Phase,
        payload: Option<EncodedPayload>,
        undo: Option<EncodedPayload>,
        cause: Option<String>,
    ) -> Result<Pending, SagaError> {
        let slot = self.inner.registry.live_slot(id, phase)?;
        let previous = slot.with(|tx| tx.advance_to(phase))?;
        let mut event = self.event(id.clone(), phase).with_payload(payload).with_undo(undo);
        if let Some(cause) = cause {
            event = event.with_cause(cause);
        }
        Ok(Pending {
            slot,
            event,
            previous: Some(previous),
        })
    }

    async fn publish(&self, pending: Pending) -> Result<(), SagaError> {
        let Pending { slot, event, previous } = pending;
        if let Err(err) = self.append(&event).await {
            if let Some(previous) = previous {
                slot.with(|tx| tx.restore(event.phase, previous));
            }
            return Err(err);
        }
        tracing::info!(
            transaction_id = %event.transaction_id,
            phase = %event.phase,
            "Phase requested"
        );
        Ok(())
    }

    fn defer(&self, pending: Pending) -> AppendHandle<()> {
        let manager = self.clone();
        AppendHandle::spawn(async move { manager.publish(pending).await })
    }

    async fn append(&self, event: &SagaEvent) -> Result<(), SagaError> {
        self.inner.log.append(&self.inner.config.topic, event).await?;
        self.inner.observer.notify(&LifecycleNotice::EventPublished {
            transaction_id: event.transaction_id.clone(),
            phase: event.phase,
        });
        Ok(())
    }

    fn encode<T: Payload>(&self, payload: &T) -> Result<EncodedPayload, SagaError> {
        Ok(EncodedPayload::encode(self.inner.config.codec, payload)?)
    }

    fn event(&self, id: TransactionId, phase: Phase) -> SagaEvent {
        SagaEvent::new(id, phase, &self.inner.config.node_name, self.inner.clock.now())
    }
}

impl std::fmt::Debug for SagaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaManager")
            .field("topic", &self.inner.config.topic)
            .field("live", &self.inner.registry.live_count())
            .finish_non_exhaustive()
    }
}

/// Handle to an append running in the background.
///
/// Resolves to the append's result. Dropping the handle does not cancel
/// the append.
#[derive(Debug)]
pub struct AppendHandle<T> {
    task: JoinHandle<Result<T, SagaError>>,
}

impl<T: Send + 'static> AppendHandle<T> {
    fn spawn(future: impl Future<Output = Result<T, SagaError>> + Send + 'static) -> Self {
        Self {
            task: tokio::spawn(future),
        }
    }

    /// Whether the append has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Future for AppendHandle<T> {
    type Output = Result<T, SagaError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| {
            joined.unwrap_or_else(|err| {
                Err(SagaError::Internal(format!("append task failed: {err}")))
            })
        })
    }
}
