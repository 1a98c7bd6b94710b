//! Lifecycle dispatcher.
//!
//! The dispatcher consumes lifecycle events from the [`EventLog`], runs the
//! registered handler for each one and turns the handler's result into an
//! [`OutcomeDecision`]: publish the next phase, leave the entry for
//! redelivery, roll the transaction back, drop the failure, or terminate.
//!
//! # Delivery semantics
//!
//! The log delivers at least once. Duplicates are short-circuited through
//! the [`TransactionRegistry`]: an event id that already finished
//! processing, a forward event arriving after a rollback was requested and
//! any event of a recently terminated transaction are acknowledged without
//! invoking a handler.
//!
//! Retries use the log's own redelivery. A retryable failure leaves the
//! entry unacknowledged; the log hands it out again once the visibility
//! timeout elapses, with an increased delivery count.
//!
//! # Recovery
//!
//! The registry lives in memory. A follow-up event published by another
//! (possibly crashed) node, or any rollback, for a transaction this node
//! does not know is adopted: the transaction is reopened in the event's
//! phase and processing continues. Participants recorded before the
//! restart are not known to the adopting node.
//!
//! # Ordering
//!
//! [`LifecycleDispatcher::run`] routes every delivery to one of
//! `consumer_concurrency` partition workers by hash of the transaction id,
//! so events of one transaction are handled one at a time and in log order
//! while different transactions proceed in parallel.

use crate::classifier::{Classification, FailureDisposition, RetryClassifier};
use crate::config::EngineConfig;
use crate::dead_letter::{CompensationTask, DeadLetter, DeadLetterQueue};
use crate::handler::{HandlerOutputs, HandlerRegistration, HandlerRegistry, PhaseEvent};
use crate::metrics::{DispatchMetrics, TransactionMetrics};
use crate::observer::{LifecycleNotice, LifecycleObserver};
use crate::registry::{Completion, Lookup, TransactionRegistry, TransactionSlot};
use crate::retry::retry_with_predicate;
use futures::StreamExt;
use sagaflow_core::environment::Clock;
use sagaflow_core::error::{CompensationFailure, CompensationFailures, SagaError};
use sagaflow_core::event::{SagaEvent, TransactionId};
use sagaflow_core::event_log::{Delivery, EventLog, Subscription};
use sagaflow_core::failure::HandlerFailure;
use sagaflow_core::payload::EncodedPayload;
use sagaflow_core::phase::{Outcome, Phase};
use sagaflow_core::transaction::{ParticipantRecord, Transaction};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pause before resubscribing after the delivery stream ended or failed.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

/// Deliveries buffered per partition worker.
const WORKER_QUEUE_DEPTH: usize = 64;

/// What the dispatcher decided for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeDecision {
    /// The handler succeeded; `next_phase` was published if set.
    Advance {
        /// Phase of the follow-up event, if one was appended
        next_phase: Option<Phase>,
        /// Payload carried by the follow-up event
        next_payload: Option<EncodedPayload>,
    },
    /// The failure is retryable; the entry stays pending for redelivery.
    Retry {
        /// Delivery number that failed
        attempt: u32,
        /// When the log is expected to redeliver
        after: Duration,
    },
    /// A rollback event was appended.
    Rollback {
        /// Human-readable cause carried by the rollback
        cause: String,
    },
    /// The transaction reached a terminal state.
    Terminate(Outcome),
    /// The failure is excluded from rollback and was dropped.
    Drop {
        /// The dropped failure
        failure: HandlerFailure,
    },
    /// Duplicate, superseded or late event; nothing was done.
    Ignore,
}

impl OutcomeDecision {
    /// Whether the delivery should be acknowledged.
    #[must_use]
    pub const fn acknowledges(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

struct DispatcherInner {
    log: Arc<dyn EventLog>,
    registry: Arc<TransactionRegistry>,
    handlers: Arc<HandlerRegistry>,
    classifier: RetryClassifier,
    config: EngineConfig,
    observer: Arc<dyn LifecycleObserver>,
    dead_letters: DeadLetterQueue<CompensationTask>,
    clock: Arc<dyn Clock>,
}

/// Drives handlers through the transaction lifecycle.
///
/// Cheap to clone; clones share the registry, handlers and dead-letter queue.
#[derive(Clone)]
pub struct LifecycleDispatcher {
    inner: Arc<DispatcherInner>,
}

impl LifecycleDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        registry: Arc<TransactionRegistry>,
        handlers: Arc<HandlerRegistry>,
        config: EngineConfig,
        observer: Arc<dyn LifecycleObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dead_letters = DeadLetterQueue::new(config.dlq_capacity).with_clock(Arc::clone(&clock));
        Self {
            inner: Arc::new(DispatcherInner {
                log,
                registry,
                handlers,
                classifier: RetryClassifier::new(config.max_delivery_attempts),
                config,
                observer,
                dead_letters,
                clock,
            }),
        }
    }

    /// Compensations that failed for good.
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterQueue<CompensationTask> {
        &self.inner.dead_letters
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Process one event on delivery number `attempt` (1-based).
    ///
    /// # Errors
    ///
    /// - [`SagaError::UnknownTransaction`] for a client-appended `Join` or `Commit` of an
    ///   unknown transaction
    /// - [`SagaError::MissingHandler`] if no handler matches the event
    /// - [`SagaError::EventLog`] if a follow-up event could not be appended
    /// - [`SagaError::Cancelled`] if `cancel` fired while the handler ran
    pub async fn dispatch(
        &self,
        event: SagaEvent,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<OutcomeDecision, SagaError> {
        DispatchMetrics::record_dispatch(event.phase);

        let Some(slot) = self.admit(&event)? else {
            return Ok(OutcomeDecision::Ignore);
        };

        if event.phase == Phase::Rollback {
            return Ok(self.roll_back(&slot, &event).await);
        }

        let registration = self.resolve(event.phase, event.payload_type())?;
        let view = PhaseEvent::new(event, self.inner.config.codec, attempt);
        let result = self.invoke(&registration, view.clone(), cancel).await?;
        let outputs = view.take_outputs();

        match result {
            Ok(()) => self.on_success(&slot, &registration, view.event(), outputs).await,
            Err(failure) => {
                self.on_failure(&slot, &registration, view.event(), outputs, failure, attempt)
                    .await
            },
        }
    }

    /// Dispatch a delivery and acknowledge it unless it must be redelivered.
    pub async fn handle_delivery(&self, delivery: Delivery, cancel: &CancellationToken) {
        let Delivery {
            event,
            token,
            delivery_count,
        } = delivery;
        let transaction_id = event.transaction_id.clone();
        let phase = event.phase;

        let acknowledge = match self.dispatch(event, delivery_count, cancel).await {
            Ok(decision) => {
                tracing::debug!(%transaction_id, %phase, ?decision, "Event dispatched");
                decision.acknowledges()
            },
            Err(SagaError::Cancelled(reason)) => {
                tracing::debug!(
                    %transaction_id,
                    %phase,
                    %reason,
                    "Dispatch cancelled, leaving entry pending"
                );
                false
            },
            Err(SagaError::EventLog(err)) => {
                tracing::warn!(
                    %transaction_id,
                    %phase,
                    error = %err,
                    "Event log failed, leaving entry pending"
                );
                false
            },
            Err(err) => {
                tracing::error!(
                    %transaction_id,
                    %phase,
                    kind = err.kind().as_str(),
                    error = %err,
                    "Dispatch failed, discarding event"
                );
                true
            },
        };

        if acknowledge {
            if let Err(err) = self.inner.log.acknowledge(&token).await {
                tracing::warn!(
                    %transaction_id,
                    %phase,
                    error = %err,
                    "Failed to acknowledge delivery"
                );
            }
        }
    }

    /// Consume the configured topic until `cancel` fires.
    ///
    /// Deliveries are routed to partition workers by transaction id. The
    /// subscription is re-established whenever the stream ends or fails.
    pub async fn run(&self, cancel: CancellationToken) {
        let config = &self.inner.config;
        let partitions = config.consumer_concurrency.max(1);
        let mut workers = JoinSet::new();
        let mut senders = Vec::with_capacity(partitions);

        for worker in 0..partitions {
            let (sender, mut receiver) = mpsc::channel::<Delivery>(WORKER_QUEUE_DEPTH);
            senders.push(sender);
            let dispatcher = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                while let Some(delivery) = receiver.recv().await {
                    dispatcher.handle_delivery(delivery, &cancel).await;
                }
                tracing::debug!(worker, "Partition worker stopped");
            });
        }

        let subscription =
            Subscription::new(&config.topic, &config.consumer_group, &config.node_name)
                .with_visibility_timeout(config.visibility_timeout);
        tracing::info!(
            topic = %subscription.topic,
            group = %subscription.group,
            consumer = %subscription.consumer,
            partitions,
            "Dispatcher started"
        );

        'subscribe: while !cancel.is_cancelled() {
            match self.inner.log.subscribe(&subscription).await {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => break 'subscribe,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(delivery)) => {
                            let worker = partition(&delivery.event.transaction_id, partitions);
                            if senders[worker].send(delivery).await.is_err() {
                                tracing::error!(
                                    worker,
                                    "Partition worker gone, stopping dispatcher"
                                );
                                break 'subscribe;
                            }
                        },
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "Delivery stream failed, resubscribing");
                            break;
                        },
                        None => {
                            tracing::info!("Delivery stream ended, resubscribing");
                            break;
                        },
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "Subscription failed, retrying");
                },
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {},
            }
        }

        drop(senders);
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "Partition worker panicked");
            }
        }
        tracing::info!(consumer = %subscription.consumer, "Dispatcher stopped");
    }

    /// Re-run the newest dead-lettered compensation.
    ///
    /// Returns the id of the relayed entry, or `None` if the queue is empty.
    /// A failed relay puts the entry back.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Handler`] if the compensation failed again and
    /// [`SagaError::MissingHandler`] if its handler is no longer registered.
    pub async fn relay_dead_letter(&self) -> Result<Option<Uuid>, SagaError> {
        match self.inner.dead_letters.pop_newest() {
            Some(letter) => self.relay(letter).await.map(Some),
            None => Ok(None),
        }
    }

    /// Re-run one dead-lettered compensation by id.
    ///
    /// Returns `false` if no entry has that id.
    ///
    /// # Errors
    ///
    /// Same as [`relay_dead_letter`](Self::relay_dead_letter).
    pub async fn relay_dead_letter_by_id(&self, id: Uuid) -> Result<bool, SagaError> {
        match self.inner.dead_letters.take(id) {
            Some(letter) => self.relay(letter).await.map(|_| true),
            None => Ok(false),
        }
    }

    fn admit(&self, event: &SagaEvent) -> Result<Option<Arc<TransactionSlot>>, SagaError> {
        let slot = match self.inner.registry.lookup(&event.transaction_id) {
            Lookup::Live(slot) => slot,
            Lookup::Terminated(_) => {
                self.ignore(event, "transaction already terminated");
                return Ok(None);
            },
            Lookup::Unknown if event.phase == Phase::Start => {
                let opened = Transaction::new(event.transaction_id.clone(), event.created_at);
                match self.inner.registry.open_if_absent(opened) {
                    Some(slot) => slot,
                    None => {
                        self.ignore(event, "transaction already terminated");
                        return Ok(None);
                    },
                }
            },
            Lookup::Unknown if event.causation_id.is_some() || event.phase == Phase::Rollback => {
                tracing::warn!(
                    transaction_id = %event.transaction_id,
                    phase = %event.phase,
                    origin = %event.origin,
                    "Adopting transaction opened elsewhere"
                );
                let adopted = Transaction::resumed(
                    event.transaction_id.clone(),
                    event.phase,
                    event.created_at,
                );
                match self.inner.registry.open_if_absent(adopted) {
                    Some(slot) => slot,
                    None => {
                        self.ignore(event, "transaction already terminated");
                        return Ok(None);
                    },
                }
            },
            Lookup::Unknown => return Err(SagaError::unknown(&event.transaction_id)),
        };

        let skip = slot.with(|tx| {
            if tx.has_processed(&event.event_id) {
                Some("event already processed")
            } else if event.phase.is_forward() && tx.is_rolling_back() {
                Some("superseded by rollback")
            } else if event.phase == Phase::Start && tx.last_phase_processed.is_some() {
                Some("start already processed")
            } else {
                None
            }
        });

        match skip {
            Some(reason) => {
                self.ignore(event, reason);
                Ok(None)
            },
            None => Ok(Some(slot)),
        }
    }

    fn ignore(&self, event: &SagaEvent, reason: &str) {
        tracing::warn!(
            transaction_id = %event.transaction_id,
            phase = %event.phase,
            event_id = %event.event_id,
            reason,
            "Ignoring event"
        );
        DispatchMetrics::record_duplicate();
        self.notify(LifecycleNotice::DuplicateIgnored {
            transaction_id: event.transaction_id.clone(),
            phase: event.phase,
            event_id: event.event_id,
        });
    }

    fn resolve(
        &self,
        phase: Phase,
        payload_type: Option<&str>,
    ) -> Result<Arc<HandlerRegistration>, SagaError> {
        self.inner
            .handlers
            .resolve(phase, payload_type)
            .ok_or_else(|| SagaError::MissingHandler {
                phase,
                payload_type: payload_type.unwrap_or("<none>").to_string(),
            })
    }

    async fn invoke(
        &self,
        registration: &HandlerRegistration,
        view: PhaseEvent,
        cancel: &CancellationToken,
    ) -> Result<Result<(), HandlerFailure>, SagaError> {
        let transaction_id = view.transaction_id().clone();
        let phase = view.phase();
        self.notify(LifecycleNotice::HandlerInvoked {
            transaction_id: transaction_id.clone(),
            phase,
            handler_id: registration.id().to_string(),
            attempt: view.attempt(),
        });

        let bound = registration.timeout().unwrap_or(self.inner.config.handler_timeout);
        let started = Instant::now();
        let result = tokio::select! {
            () = cancel.cancelled() => {
                return Err(SagaError::Cancelled(format!(
                    "{phase} handler '{}' of transaction '{transaction_id}'",
                    registration.id()
                )));
            },
            result = run_bounded(registration, view, bound) => result,
        };
        DispatchMetrics::record_handler(phase, started.elapsed());

        if result.is_ok() {
            self.notify(LifecycleNotice::HandlerSucceeded {
                transaction_id,
                phase,
                handler_id: registration.id().to_string(),
            });
        }
        Ok(result)
    }

    async fn on_success(
        &self,
        slot: &TransactionSlot,
        registration: &HandlerRegistration,
        event: &SagaEvent,
        outputs: HandlerOutputs,
    ) -> Result<OutcomeDecision, SagaError> {
        let phase = event.phase;
        tracing::info!(
            transaction_id = %event.transaction_id,
            %phase,
            handler = registration.id(),
            "Handler succeeded"
        );

        if phase == Phase::Commit {
            slot.with(|tx| tx.record_processed(event.event_id, phase));
            self.finish(&event.transaction_id, Completion::new(Outcome::Committed));
            return Ok(OutcomeDecision::Terminate(Outcome::Committed));
        }

        let step_undo = outputs.undo.clone().or_else(|| event.undo.clone());
        let participant = (phase == Phase::Join).then(|| ParticipantRecord {
            handler_id: registration.id().to_string(),
            payload_type: event.payload_type().map(str::to_string),
            last_phase_processed: Phase::Join,
            undo_payload: step_undo.clone(),
            joined_at: self.inner.clock.now(),
        });

        let Some(next_phase) = registration.success_with().next_phase() else {
            settle(slot, event, participant);
            return Ok(OutcomeDecision::Advance {
                next_phase: None,
                next_payload: None,
            });
        };

        let next_payload = outputs.next_event.or_else(|| event.payload.clone());
        let next_undo = match (phase, next_phase) {
            (Phase::Start, Phase::Join) => outputs.undo.or_else(|| next_payload.clone()),
            (_, Phase::Join) => next_payload.clone(),
            _ => None,
        };

        let previous = match slot.with(|tx| tx.advance_to(next_phase)) {
            Ok(previous) => previous,
            Err(err) => {
                tracing::error!(
                    transaction_id = %event.transaction_id,
                    %phase,
                    %next_phase,
                    error = %err,
                    "Follow-up phase rejected, rolling back"
                );
                let payload = event.payload.clone();
                let decision = self
                    .request_rollback(slot, event, payload, step_undo, err.to_string())
                    .await?;
                settle(slot, event, None);
                return Ok(decision);
            },
        };

        let follow_up = self
            .event(&event.transaction_id, next_phase)
            .with_payload(next_payload.clone())
            .with_undo(next_undo)
            .caused_by(event.event_id);
        if let Err(err) = self.append(&follow_up).await {
            slot.with(|tx| tx.restore(next_phase, previous));
            return Err(err);
        }

        settle(slot, event, participant);
        Ok(OutcomeDecision::Advance {
            next_phase: Some(next_phase),
            next_payload,
        })
    }

    async fn on_failure(
        &self,
        slot: &TransactionSlot,
        registration: &HandlerRegistration,
        event: &SagaEvent,
        outputs: HandlerOutputs,
        failure: HandlerFailure,
        attempt: u32,
    ) -> Result<OutcomeDecision, SagaError> {
        let disposition = self.inner.classifier.disposition(
            &failure,
            registration.retry_exclusions(),
            registration.rollback_exclusions(),
            attempt,
        );
        DispatchMetrics::record_failure(event.phase, disposition.as_str());
        self.notify(LifecycleNotice::HandlerFailed {
            transaction_id: event.transaction_id.clone(),
            phase: event.phase,
            handler_id: registration.id().to_string(),
            failure: failure.clone(),
            disposition,
        });

        match disposition {
            FailureDisposition::Redeliver => {
                tracing::warn!(
                    transaction_id = %event.transaction_id,
                    phase = %event.phase,
                    handler = registration.id(),
                    attempt,
                    error = %failure,
                    "Handler failed, awaiting redelivery"
                );
                Ok(OutcomeDecision::Retry {
                    attempt,
                    after: self.inner.config.visibility_timeout,
                })
            },
            FailureDisposition::Drop => {
                tracing::warn!(
                    transaction_id = %event.transaction_id,
                    phase = %event.phase,
                    handler = registration.id(),
                    attempt,
                    error = %failure,
                    "Handler failed with a kind excluded from rollback, dropping"
                );
                slot.with(|tx| tx.record_processed(event.event_id, event.phase));
                Ok(OutcomeDecision::Drop { failure })
            },
            FailureDisposition::Rollback => {
                let payload = outputs.next_event.or_else(|| event.payload.clone());
                let undo = outputs.undo.or_else(|| event.undo.clone());
                let decision = self
                    .request_rollback(slot, event, payload, undo, failure.to_string())
                    .await?;
                slot.with(|tx| tx.record_processed(event.event_id, event.phase));
                Ok(decision)
            },
        }
    }

    /// Append the one rollback event of a transaction.
    async fn request_rollback(
        &self,
        slot: &TransactionSlot,
        cause_event: &SagaEvent,
        payload: Option<EncodedPayload>,
        undo: Option<EncodedPayload>,
        cause: String,
    ) -> Result<OutcomeDecision, SagaError> {
        let Ok(previous) = slot.with(|tx| tx.advance_to(Phase::Rollback)) else {
            tracing::debug!(
                transaction_id = %cause_event.transaction_id,
                "Rollback already requested"
            );
            return Ok(OutcomeDecision::Ignore);
        };

        let rollback = self
            .event(&cause_event.transaction_id, Phase::Rollback)
            .with_payload(payload)
            .with_undo(undo)
            .with_cause(cause.clone())
            .caused_by(cause_event.event_id);
        if let Err(err) = self.append(&rollback).await {
            slot.with(|tx| tx.restore(Phase::Rollback, previous));
            return Err(err);
        }

        tracing::error!(
            transaction_id = %cause_event.transaction_id,
            phase = %cause_event.phase,
            %cause,
            "Rollback requested"
        );
        Ok(OutcomeDecision::Rollback { cause })
    }

    /// Compensate the failed step and every participant, newest first.
    async fn roll_back(&self, slot: &TransactionSlot, event: &SagaEvent) -> OutcomeDecision {
        let transaction_id = &event.transaction_id;
        let participants = slot.with(|tx| {
            if !tx.is_rolling_back() {
                let _ = tx.advance_to(Phase::Rollback);
            }
            tx.participants.clone()
        });
        tracing::info!(
            %transaction_id,
            participants = participants.len(),
            cause = event.cause.as_deref().unwrap_or(""),
            "Rolling back"
        );

        let mut failures = CompensationFailures::new(transaction_id.clone());

        // The failed step itself, when it left something to undo.
        if event.undo.is_some() {
            let primary = self.inner.handlers.resolve(Phase::Rollback, event.payload_type());
            if let Some(primary) = primary {
                let payload_type = event.payload_type().map(str::to_string);
                self.compensate(&primary, event.clone(), payload_type, &mut failures)
                    .await;
            }
        }

        for participant in participants.iter().rev() {
            let payload_type = participant.payload_type.clone();
            let Some(handler) = self
                .inner
                .handlers
                .resolve(Phase::Rollback, payload_type.as_deref())
            else {
                tracing::warn!(
                    %transaction_id,
                    participant = %participant.handler_id,
                    payload = payload_type.as_deref().unwrap_or("<none>"),
                    "No rollback handler for participant, skipping"
                );
                continue;
            };
            let compensation = event.clone().with_undo(participant.undo_payload.clone());
            self.compensate(&handler, compensation, payload_type, &mut failures)
                .await;
        }

        slot.with(|tx| tx.record_processed(event.event_id, Phase::Rollback));
        let compensation_failures = (!failures.is_empty()).then_some(failures);
        self.finish(
            transaction_id,
            Completion {
                outcome: Outcome::RolledBack,
                compensation_failures,
            },
        );
        OutcomeDecision::Terminate(Outcome::RolledBack)
    }

    async fn compensate(
        &self,
        handler: &Arc<HandlerRegistration>,
        event: SagaEvent,
        payload_type: Option<String>,
        failures: &mut CompensationFailures,
    ) {
        let policy = self.inner.config.compensation_policy.retry_policy();
        let bound = handler.timeout().unwrap_or(self.inner.config.handler_timeout);
        let codec = self.inner.config.codec;
        let mut attempt = 0;

        let outcome = retry_with_predicate(
            &policy,
            || {
                attempt += 1;
                let view = PhaseEvent::new(event.clone(), codec, attempt);
                let handler = Arc::clone(handler);
                async move { run_bounded(&handler, view, bound).await }
            },
            |failure: &HandlerFailure| {
                RetryClassifier::classify(failure, handler.retry_exclusions())
                    == Classification::Retryable
            },
        )
        .await;

        let transaction_id = event.transaction_id.clone();
        match outcome.value {
            Ok(()) => {
                tracing::info!(%transaction_id, handler = handler.id(), "Compensated");
                self.notify(LifecycleNotice::Compensated {
                    transaction_id,
                    handler_id: handler.id().to_string(),
                });
            },
            Err(failure) => {
                let compensation = CompensationFailure {
                    handler_id: handler.id().to_string(),
                    payload_type: payload_type.clone(),
                    failure: failure.clone(),
                    attempts: outcome.attempts,
                };
                tracing::error!(
                    %transaction_id,
                    handler = handler.id(),
                    attempts = outcome.attempts,
                    error = %failure,
                    "Compensation failed"
                );
                TransactionMetrics::record_compensation_failure();
                self.notify(LifecycleNotice::CompensationFailed {
                    transaction_id: transaction_id.clone(),
                    failure: compensation.clone(),
                });
                let task = CompensationTask {
                    event,
                    payload_type,
                    handler_id: handler.id().to_string(),
                };
                self.inner
                    .dead_letters
                    .push(transaction_id, task, failure, outcome.attempts);
                failures.push(compensation);
            },
        }
    }

    async fn relay(&self, mut letter: DeadLetter<CompensationTask>) -> Result<Uuid, SagaError> {
        let task = &letter.payload;
        let handler = match self.resolve(Phase::Rollback, task.payload_type.as_deref()) {
            Ok(handler) => handler,
            Err(err) => {
                self.inner.dead_letters.restore(letter);
                return Err(err);
            },
        };

        let bound = handler.timeout().unwrap_or(self.inner.config.handler_timeout);
        let view =
            PhaseEvent::new(task.event.clone(), self.inner.config.codec, letter.attempts + 1);
        let transaction_id = letter.transaction_id.clone();

        match run_bounded(&handler, view, bound).await {
            Ok(()) => {
                tracing::info!(%transaction_id, handler = handler.id(), "Dead letter relayed");
                self.notify(LifecycleNotice::Compensated {
                    transaction_id,
                    handler_id: handler.id().to_string(),
                });
                Ok(letter.id)
            },
            Err(failure) => {
                tracing::warn!(
                    %transaction_id,
                    handler = handler.id(),
                    error = %failure,
                    "Dead letter relay failed"
                );
                letter.failure = failure.clone();
                letter.attempts += 1;
                self.inner.dead_letters.restore(letter);
                Err(SagaError::Handler {
                    id: transaction_id,
                    phase: Phase::Rollback,
                    failure,
                })
            },
        }
    }

    fn event(&self, transaction_id: &TransactionId, phase: Phase) -> SagaEvent {
        SagaEvent::new(
            transaction_id.clone(),
            phase,
            &self.inner.config.node_name,
            self.inner.clock.now(),
        )
    }

    async fn append(&self, event: &SagaEvent) -> Result<(), SagaError> {
        self.inner.log.append(&self.inner.config.topic, event).await?;
        self.notify(LifecycleNotice::EventPublished {
            transaction_id: event.transaction_id.clone(),
            phase: event.phase,
        });
        Ok(())
    }

    fn finish(&self, transaction_id: &TransactionId, completion: Completion) {
        let outcome = completion.outcome;
        self.inner.registry.complete(transaction_id, completion);
        TransactionMetrics::record_terminated(outcome);
        tracing::info!(%transaction_id, %outcome, "Transaction terminated");
        self.notify(LifecycleNotice::Terminated {
            transaction_id: transaction_id.clone(),
            outcome,
        });
    }

    fn notify(&self, notice: LifecycleNotice) {
        self.inner.observer.notify(&notice);
    }
}

impl std::fmt::Debug for LifecycleDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleDispatcher")
            .field("topic", &self.inner.config.topic)
            .field("handlers", &self.inner.handlers.len())
            .field("dead_letters", &self.inner.dead_letters.len())
            .finish_non_exhaustive()
    }
}

/// Record the processed event and, for a join, its participant.
fn settle(slot: &TransactionSlot, event: &SagaEvent, participant: Option<ParticipantRecord>) {
    slot.with(|tx| {
        if let Some(participant) = participant {
            tx.add_participant(participant);
        }
        tx.record_processed(event.event_id, event.phase);
    });
}

async fn run_bounded(
    registration: &HandlerRegistration,
    view: PhaseEvent,
    bound: Duration,
) -> Result<(), HandlerFailure> {
    tokio::time::timeout(bound, registration.invoke(view))
        .await
        .unwrap_or_else(|_| {
            Err(HandlerFailure::timeout(format!(
                "handler '{}' did not finish within {bound:?}",
                registration.id()
            )))
        })
}

fn partition(transaction_id: &TransactionId, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    transaction_id.hash(&mut hasher);
    usize::try_from(hasher.finish() % partitions.max(1) as u64).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::{HandlerRegistration, SuccessWith};
    use crate::observer::NoOpObserver;
    use chrono::Utc;
    use sagaflow_core::codec::Codec;
    use sagaflow_core::environment::SystemClock;
    use sagaflow_core::event::EventId;
    use sagaflow_core::event_log::{DeliveryStream, DeliveryToken, EntryId, EventLogError};
    use sagaflow_core::failure::{FailureKind, HandlerFailure};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Log that only records appends.
    #[derive(Default)]
    struct AppendOnlyLog {
        appended: Mutex<Vec<SagaEvent>>,
    }

    impl AppendOnlyLog {
        fn phases(&self) -> Vec<Phase> {
            self.appended.lock().unwrap().iter().map(|e| e.phase).collect()
        }

        fn last(&self) -> SagaEvent {
            self.appended.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl EventLog for AppendOnlyLog {
        fn append(
            &self,
            _topic: &str,
            event: &SagaEvent,
        ) -> Pin<Box<dyn Future<Output = Result<EntryId, EventLogError>> + Send + '_>> {
            let mut appended = self.appended.lock().unwrap();
            appended.push(event.clone());
            let id = EntryId(appended.len() as u64);
            Box::pin(async move { Ok(id) })
        }

        fn subscribe(
            &self,
            _subscription: &Subscription,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventLogError>> + Send + '_>> {
            Box::pin(async { Ok(Box::pin(futures::stream::empty()) as DeliveryStream) })
        }

        fn acknowledge(
            &self,
            _token: &DeliveryToken,
        ) -> Pin<Box<dyn Future<Output = Result<(), EventLogError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn dispatcher(
        log: Arc<AppendOnlyLog>,
        handlers: Vec<HandlerRegistration>,
    ) -> LifecycleDispatcher {
        let mut registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler).unwrap();
        }
        LifecycleDispatcher::new(
            log,
            Arc::new(TransactionRegistry::new(16)),
            Arc::new(registry),
            EngineConfig::default().with_node_name("test-node"),
            Arc::new(NoOpObserver),
            Arc::new(SystemClock),
        )
    }

    fn start_event(amount: i64) -> SagaEvent {
        SagaEvent::new("tx-1".into(), Phase::Start, "client", Utc::now())
            .with_payload(Some(EncodedPayload::encode(Codec::Json, &amount).unwrap()))
    }

    #[tokio::test]
    async fn start_success_publishes_join() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![
                HandlerRegistration::on_start::<i64>()
                    .success_with(SuccessWith::PublishJoin)
                    .handle_sync(|_| Ok(())),
            ],
        );

        let decision = dispatcher
            .dispatch(start_event(5), 1, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(decision, OutcomeDecision::Advance { next_phase: Some(Phase::Join), .. }));
        assert_eq!(log.phases(), vec![Phase::Join]);
        let join = log.last();
        let amount: i64 = join.undo.unwrap().decode(Codec::Json).unwrap();
        assert_eq!(amount, 5);
    }

    #[tokio::test]
    async fn duplicate_start_is_ignored() {
        let log = Arc::new(AppendOnlyLog::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![HandlerRegistration::on_start::<i64>().handle_sync(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })],
        );
        let event = start_event(1);
        let cancel = CancellationToken::new();

        dispatcher.dispatch(event.clone(), 1, &cancel).await.unwrap();
        let again = dispatcher.dispatch(event, 2, &cancel).await.unwrap();

        assert_eq!(again, OutcomeDecision::Ignore);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failure_waits_then_rolls_back() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![
                HandlerRegistration::on_start::<i64>()
                    .handle_sync(|_| Err(HandlerFailure::transient("downstream busy"))),
            ],
        );
        let event = start_event(1);
        let cancel = CancellationToken::new();

        let first = dispatcher.dispatch(event.clone(), 1, &cancel).await.unwrap();
        assert!(matches!(first, OutcomeDecision::Retry { attempt: 1, .. }));
        assert!(log.phases().is_empty());

        let last = dispatcher.dispatch(event, 3, &cancel).await.unwrap();
        assert!(matches!(last, OutcomeDecision::Rollback { .. }));
        assert_eq!(log.phases(), vec![Phase::Rollback]);
        assert!(log.last().cause.unwrap().contains("downstream busy"));
    }

    #[tokio::test]
    async fn rollback_exclusion_drops_failure() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![
                HandlerRegistration::on_start::<i64>()
                    .skip_retry_for([FailureKind::Codec])
                    .skip_rollback_for([FailureKind::Codec])
                    .handle_sync(|_| Err(HandlerFailure::new(FailureKind::Decode, "bad bytes"))),
            ],
        );

        let decision = dispatcher
            .dispatch(start_event(1), 1, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(decision, OutcomeDecision::Drop { .. }));
        assert!(log.phases().is_empty());
    }

    #[tokio::test]
    async fn unknown_join_is_surfaced() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(Arc::clone(&log), vec![]);
        let join = SagaEvent::new("ghost".into(), Phase::Join, "client", Utc::now());

        let err = dispatcher
            .dispatch(join, 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::UnknownTransaction { .. }));
    }

    #[tokio::test]
    async fn follow_up_of_unknown_transaction_is_adopted() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![
                HandlerRegistration::on_join::<i64>()
                    .success_with(SuccessWith::PublishCommit)
                    .handle_sync(|_| Ok(())),
            ],
        );
        let join = SagaEvent::new("tx-7".into(), Phase::Join, "other-node", Utc::now())
            .with_payload(Some(EncodedPayload::encode(Codec::Json, &3_i64).unwrap()))
            .caused_by(EventId::new());

        let decision = dispatcher
            .dispatch(join, 2, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            decision,
            OutcomeDecision::Advance { next_phase: Some(Phase::Commit), .. }
        ));
        assert_eq!(log.phases(), vec![Phase::Commit]);
        let adopted = dispatcher.inner.registry.state(&"tx-7".into()).unwrap();
        assert_eq!(adopted, sagaflow_core::phase::TransactionState::Active(Phase::Commit));
    }

    #[tokio::test]
    async fn rollback_of_unknown_transaction_terminates() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(Arc::clone(&log), vec![]);
        let rollback = SagaEvent::new("tx-8".into(), Phase::Rollback, "client", Utc::now())
            .with_cause("operator abort");

        let decision = dispatcher
            .dispatch(rollback, 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(decision, OutcomeDecision::Terminate(Outcome::RolledBack));
        assert!(dispatcher.inner.registry.is_recently_terminated(&"tx-8".into()));
    }

    #[tokio::test]
    async fn rollback_compensates_failed_step_only_with_undo() {
        let log = Arc::new(AppendOnlyLog::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![
                HandlerRegistration::on_start::<i64>()
                    .skip_retry_for([FailureKind::Validation])
                    .handle_sync(|event| {
                        event.set_undo_payload(&-1_i64)?;
                        Err(HandlerFailure::validation("over limit"))
                    }),
                HandlerRegistration::on_rollback::<i64>().handle_sync(move |event| {
                    let undo: i64 = event.decode_undo()?;
                    assert_eq!(undo, -1);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ],
        );
        let cancel = CancellationToken::new();

        dispatcher.dispatch(start_event(4), 1, &cancel).await.unwrap();
        let rollback = log.last();
        assert_eq!(rollback.phase, Phase::Rollback);
        assert!(rollback.undo.is_some());
        let decision = dispatcher.dispatch(rollback.clone(), 1, &cancel).await.unwrap();

        assert_eq!(decision, OutcomeDecision::Terminate(Outcome::RolledBack));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let bare = SagaEvent::new("tx-2".into(), Phase::Rollback, "client", Utc::now())
            .with_payload(rollback.payload);
        dispatcher.dispatch(bare, 1, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_handler_is_surfaced() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(Arc::clone(&log), vec![]);

        let err = dispatcher
            .dispatch(start_event(1), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::MissingHandler { phase: Phase::Start, .. }));
    }

    #[tokio::test]
    async fn slow_handler_times_out_as_failure() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![
                HandlerRegistration::on_start::<i64>()
                    .timeout(Duration::from_millis(10))
                    .handle(|_| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }),
            ],
        );

        let decision = dispatcher
            .dispatch(start_event(1), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(decision, OutcomeDecision::Retry { .. }));
    }

    #[tokio::test]
    async fn cancelled_dispatch_appends_nothing() {
        let log = Arc::new(AppendOnlyLog::default());
        let dispatcher = dispatcher(
            Arc::clone(&log),
            vec![
                HandlerRegistration::on_start::<i64>()
                    .success_with(SuccessWith::PublishCommit)
                    .handle(|_| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }),
            ],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher.dispatch(start_event(1), 1, &cancel).await.unwrap_err();
        assert!(matches!(err, SagaError::Cancelled(_)));
        assert!(log.phases().is_empty());
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        let id = TransactionId::new("tx-42");
        let first = partition(&id, 4);
        assert!(first < 4);
        assert_eq!(partition(&id, 4), first);
        assert_eq!(partition(&id, 1), 0);
    }
}
