//! In-process orchestrator pipelines.
//!
//! An [`Orchestrator`] runs a whole saga inside one process: a `start`
//! stage, any number of `join` stages and a `commit` stage, each a
//! [`Stage`] pairing a forward function with an optional compensating one.
//! Each stage's output is the next stage's input, checked at compile time.
//!
//! Failed stage attempts are retried with backoff unless the failure kind
//! is in the stage's retry exclusions. A stage that still fails triggers
//! compensation of the failing stage and then of every earlier stage in
//! reverse order, unless the failure kind is in the stage's rollback
//! exclusions, in which case the run simply fails.
//!
//! Runs are tracked in a [`TransactionRegistry`] like event-driven
//! transactions, so [`SagaManager::exists`](crate::manager::SagaManager::exists)
//! sees them when both share a registry.
//!
//! # Example
//!
//! ```
//! use sagaflow_core::failure::HandlerFailure;
//! use sagaflow_runtime::orchestrator::{Orchestrator, Stage};
//!
//! # async fn example() {
//! let orchestrator = Orchestrator::builder("checkout")
//!     .start(Stage::sync(|amount: i64, _ctx| Ok(amount)))
//!     .join(Stage::sync(|amount: i64, _ctx| {
//!         if amount < 10 {
//!             Err(HandlerFailure::validation("amount below threshold"))
//!         } else {
//!             Ok(amount * 2)
//!         }
//!     }))
//!     .commit(Stage::sync(|amount: i64, _ctx| Ok(format!("charged {amount}"))))
//!     .build();
//!
//! let result = orchestrator.saga(&25).await;
//! assert!(result.is_success());
//! assert_eq!(result.decode_result().unwrap(), "charged 50");
//! # }
//! ```

mod context;
mod result;
mod stage;

pub use context::OrchestrateContext;
pub use result::OrchestrateResult;
pub use stage::Stage;

use crate::classifier::{Classification, FailureDisposition, RetryClassifier};
use crate::config::{CompensationPolicy, EngineConfig};
use crate::metrics::{OrchestratorMetrics, TransactionMetrics};
use crate::observer::{LifecycleNotice, LifecycleObserver, NoOpObserver};
use crate::registry::{Completion, TransactionRegistry, TransactionSlot};
use crate::retry::{RetryPolicy, retry_with_predicate};
use sagaflow_core::codec::Codec;
use sagaflow_core::environment::{Clock, IdGenerator, SystemClock, UuidGenerator};
use sagaflow_core::error::{CompensationFailure, CompensationFailures, SagaError};
use sagaflow_core::event::TransactionId;
use sagaflow_core::failure::HandlerFailure;
use sagaflow_core::payload::EncodedPayload;
use sagaflow_core::phase::{Outcome, Phase};
use sagaflow_core::transaction::{ParticipantRecord, Transaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stage::ErasedStage;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Settings {
    name: String,
    codec: Codec,
    retry: RetryPolicy,
    timeout: Duration,
    compensation: CompensationPolicy,
    observer: Arc<dyn LifecycleObserver>,
    registry: Arc<TransactionRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

/// Entry point of the orchestrator builder.
pub struct OrchestratorBuilder {
    settings: Settings,
}

impl OrchestratorBuilder {
    /// Use `codec` for values crossing stage boundaries.
    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.settings.codec = codec;
        self
    }

    /// Back off between failed stage attempts with `policy`.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.settings.retry = policy;
        self
    }

    /// Bound every run by `timeout` unless the caller chooses another.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = timeout;
        self
    }

    /// Retry compensating functions according to `policy`.
    #[must_use]
    pub fn with_compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.settings.compensation = policy;
        self
    }

    /// Report lifecycle notices to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.settings.observer = observer;
        self
    }

    /// Track runs in a shared registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<TransactionRegistry>) -> Self {
        self.settings.registry = registry;
        self
    }

    /// Allocate run ids with `ids`.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.settings.ids = ids;
        self
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.settings.clock = clock;
        self
    }

    /// Take codec, retry, timeout and compensation settings from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.settings.codec = config.codec;
        self.settings.retry = config.orchestrator_retry.clone();
        self.settings.timeout = config.orchestrator_timeout;
        self.settings.compensation = config.compensation_policy.clone();
        self
    }

    /// Declare the `start` stage.
    #[must_use]
    pub fn start<Req, O>(self, stage: Stage<Req, O>) -> PipelineBuilder<Req, O> {
        PipelineBuilder {
            settings: self.settings,
            stages: vec![stage.erase("start".to_string())],
            _types: PhantomData,
        }
    }
}

/// Pipeline under construction whose last stage produces `Cur`.
pub struct PipelineBuilder<Req, Cur> {
    settings: Settings,
    stages: Vec<ErasedStage>,
    _types: PhantomData<fn(Req) -> Cur>,
}

impl<Req, Cur> PipelineBuilder<Req, Cur> {
    /// Append a `join` stage consuming the previous stage's output.
    #[must_use]
    pub fn join<O>(mut self, stage: Stage<Cur, O>) -> PipelineBuilder<Req, O> {
        let default_name = format!("join-{}", self.stages.len());
        self.stages.push(stage.erase(default_name));
        PipelineBuilder {
            settings: self.settings,
            stages: self.stages,
            _types: PhantomData,
        }
    }

    /// Append the `commit` stage, completing the pipeline.
    #[must_use]
    pub fn commit<O>(mut self, stage: Stage<Cur, O>) -> CommitBuilder<Req, O> {
        self.stages.push(stage.erase("commit".to_string()));
        CommitBuilder {
            settings: self.settings,
            stages: self.stages,
            _types: PhantomData,
        }
    }
}

/// A complete pipeline, ready to build.
pub struct CommitBuilder<Req, Out> {
    settings: Settings,
    stages: Vec<ErasedStage>,
    _types: PhantomData<fn(Req) -> Out>,
}

impl<Req, Out> CommitBuilder<Req, Out> {
    /// Build the orchestrator.
    #[must_use]
    pub fn build(self) -> Orchestrator<Req, Out> {
        tracing::debug!(
            orchestrator = %self.settings.name,
            stages = self.stages.len(),
            "Orchestrator built"
        );
        Orchestrator {
            inner: Arc::new(OrchestratorInner {
                settings: self.settings,
                stages: self.stages,
            }),
            _types: PhantomData,
        }
    }
}

struct OrchestratorInner {
    settings: Settings,
    stages: Vec<ErasedStage>,
}

/// How a run was cut short.
enum Interruption {
    Cancelled,
    TimedOut,
}

/// An executable pipeline taking `Req` and producing `Out`.
///
/// Cheap to clone; clones share stages and settings.
pub struct Orchestrator<Req, Out> {
    inner: Arc<OrchestratorInner>,
    _types: PhantomData<fn(Req) -> Out>,
}

impl Orchestrator<(), ()> {
    /// Start building an orchestrator called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> OrchestratorBuilder {
        let config = EngineConfig::default();
        OrchestratorBuilder {
            settings: Settings {
                name: name.into(),
                codec: config.codec,
                retry: config.orchestrator_retry,
                timeout: config.orchestrator_timeout,
                compensation: config.compensation_policy,
                observer: Arc::new(NoOpObserver),
                registry: Arc::new(TransactionRegistry::default()),
                ids: Arc::new(UuidGenerator),
                clock: Arc::new(SystemClock),
            },
        }
    }
}

impl<Req, Out> Orchestrator<Req, Out>
where
    Req: Serialize,
    Out: DeserializeOwned + Send + 'static,
{
    /// Run the pipeline with the default timeout.
    pub async fn saga(&self, request: &Req) -> OrchestrateResult<Out> {
        let context = OrchestrateContext::with_codec(self.inner.settings.codec);
        self.saga_with_context(request, context).await
    }

    /// Run the pipeline with a caller-supplied context.
    pub async fn saga_with_context(
        &self,
        request: &Req,
        context: OrchestrateContext,
    ) -> OrchestrateResult<Out> {
        let timeout = self.inner.settings.timeout;
        self.launch(request, context, timeout, CancellationToken::new()).await
    }

    /// Run the pipeline, failing with a timeout if it runs longer than `timeout`.
    pub async fn saga_with_timeout(
        &self,
        timeout: Duration,
        request: &Req,
    ) -> OrchestrateResult<Out> {
        let context = OrchestrateContext::with_codec(self.inner.settings.codec);
        self.launch(request, context, timeout, CancellationToken::new()).await
    }

    /// Run the pipeline in the background.
    #[must_use]
    pub fn spawn(&self, request: &Req) -> OrchestrateHandle<Out> {
        let cancel = CancellationToken::new();
        let transaction_id = self.inner.settings.ids.next_id();
        let codec = self.inner.settings.codec;

        let task = match codec.encode(request) {
            Ok(input) => {
                let inner = Arc::clone(&self.inner);
                let context = OrchestrateContext::with_codec(codec);
                let timeout = inner.settings.timeout;
                let token = cancel.clone();
                let id = transaction_id.clone();
                tokio::spawn(
                    async move { inner.execute::<Out>(id, input, context, timeout, token).await },
                )
            },
            Err(err) => {
                let id = transaction_id.clone();
                let failed = OrchestrateResult::failed(id, codec, err.into(), None, None);
                tokio::spawn(async move { failed })
            },
        };

        OrchestrateHandle {
            task,
            cancel,
            transaction_id,
            codec,
        }
    }

    async fn launch(
        &self,
        request: &Req,
        context: OrchestrateContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> OrchestrateResult<Out> {
        let settings = &self.inner.settings;
        let transaction_id = settings.ids.next_id();
        match settings.codec.encode(request) {
            Ok(input) => {
                self.inner
                    .execute(transaction_id, input, context, timeout, cancel)
                    .await
            },
            Err(err) => {
                OrchestrateResult::failed(transaction_id, settings.codec, err.into(), None, None)
            },
        }
    }
}

impl<Req, Out> Orchestrator<Req, Out> {
    /// The orchestrator's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    /// Number of stages, `start` and `commit` included.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.inner.stages.len()
    }

    /// The registry runs are tracked in.
    #[must_use]
    pub fn registry(&self) -> &TransactionRegistry {
        &self.inner.settings.registry
    }
}

impl<Req, Out> Clone for Orchestrator<Req, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _types: PhantomData,
        }
    }
}

impl<Req, Out> fmt::Debug for Orchestrator<Req, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<&str> = self.inner.stages.iter().map(|s| s.name.as_str()).collect();
        f.debug_struct("Orchestrator")
            .field("name", &self.inner.settings.name)
            .field("stages", &stages)
            .field("timeout", &self.inner.settings.timeout)
            .finish_non_exhaustive()
    }
}

impl OrchestratorInner {
    async fn execute<Out>(
        &self,
        transaction_id: TransactionId,
        input: Vec<u8>,
        context: OrchestrateContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> OrchestrateResult<Out> {
        let settings = &self.settings;
        let codec = settings.codec;
        let slot = match settings
            .registry
            .open(Transaction::new(transaction_id.clone(), settings.clock.now()))
        {
            Ok(slot) => slot,
            Err(err) => {
                OrchestratorMetrics::record_run("failed");
                return OrchestrateResult::failed(transaction_id, codec, err, None, None);
            },
        };
        TransactionMetrics::record_started();
        self.notify(LifecycleNotice::Started {
            transaction_id: transaction_id.clone(),
        });
        tracing::info!(orchestrator = %settings.name, %transaction_id, "Orchestrator run started");

        let deadline = tokio::time::Instant::now() + timeout;
        let last = self.stages.len().saturating_sub(1);
        let mut executed: Vec<(usize, Vec<u8>)> = Vec::with_capacity(self.stages.len());
        let mut current = input;

        for (index, stage) in self.stages.iter().enumerate() {
            let phase = match index {
                0 => Phase::Start,
                i if i == last => Phase::Commit,
                _ => Phase::Join,
            };
            if index > 0 {
                let advanced = slot.with(|tx| tx.advance_to(phase));
                if let Err(err) = advanced {
                    tracing::error!(%transaction_id, error = %err, "Orchestrator phase rejected");
                }
            }

            let attempt = tokio::select! {
                () = cancel.cancelled() => Err(Interruption::Cancelled),
                () = tokio::time::sleep_until(deadline) => Err(Interruption::TimedOut),
                attempt = self.run_stage(&transaction_id, stage, phase, &current, &context) => {
                    Ok(attempt)
                },
            };

            match attempt {
                Ok(Ok(output)) => {
                    slot.with(|tx| {
                        tx.add_participant(ParticipantRecord {
                            handler_id: stage.name.clone(),
                            payload_type: None,
                            last_phase_processed: phase,
                            undo_payload: Some(EncodedPayload::new(
                                stage.name.clone(),
                                current.clone(),
                            )),
                            joined_at: settings.clock.now(),
                        });
                    });
                    executed.push((index, std::mem::replace(&mut current, output)));
                },
                Ok(Err(failure)) => {
                    let skip = RetryClassifier::classify(&failure, &stage.rollback_exclusions)
                        == Classification::Skip;
                    let disposition = if skip {
                        FailureDisposition::Drop
                    } else {
                        FailureDisposition::Rollback
                    };
                    self.notify(LifecycleNotice::HandlerFailed {
                        transaction_id: transaction_id.clone(),
                        phase,
                        handler_id: stage.name.clone(),
                        failure: failure.clone(),
                        disposition,
                    });
                    let cause = SagaError::Handler {
                        id: transaction_id.clone(),
                        phase,
                        failure,
                    };

                    let failed_stage = Some(stage.name.clone());
                    if skip {
                        tracing::warn!(
                            %transaction_id,
                            stage = %stage.name,
                            error = %cause,
                            "Stage failed, rollback skipped"
                        );
                        self.mark_rolled_back(&slot, &transaction_id, None);
                        OrchestratorMetrics::record_run("failed");
                        return OrchestrateResult::failed(
                            transaction_id,
                            codec,
                            cause,
                            failed_stage,
                            None,
                        );
                    }

                    tracing::error!(
                        %transaction_id,
                        stage = %stage.name,
                        error = %cause,
                        "Stage failed, compensating"
                    );
                    executed.push((index, current));
                    let failures =
                        self.compensate(&slot, &transaction_id, executed, &context).await;
                    OrchestratorMetrics::record_run("failed");
                    return OrchestrateResult::failed(
                        transaction_id,
                        codec,
                        cause,
                        failed_stage,
                        failures,
                    );
                },
                Err(interruption) => {
                    let (cause, label) = match interruption {
                        Interruption::Cancelled => (
                            SagaError::Cancelled(format!(
                                "orchestrator '{}' run '{transaction_id}'",
                                settings.name
                            )),
                            "cancelled",
                        ),
                        Interruption::TimedOut => (
                            SagaError::Timeout {
                                operation: format!("orchestrator '{}'", settings.name),
                                after: timeout,
                            },
                            "timeout",
                        ),
                    };
                    tracing::warn!(
                        %transaction_id,
                        stage = %stage.name,
                        error = %cause,
                        "Run interrupted, compensating"
                    );
                    let failed_stage = Some(stage.name.clone());
                    executed.push((index, current));
                    let failures =
                        self.compensate(&slot, &transaction_id, executed, &context).await;
                    OrchestratorMetrics::record_run(label);
                    return OrchestrateResult::failed(
                        transaction_id,
                        codec,
                        cause,
                        failed_stage,
                        failures,
                    );
                },
            }
        }

        settings
            .registry
            .complete(&transaction_id, Completion::new(Outcome::Committed));
        TransactionMetrics::record_terminated(Outcome::Committed);
        self.notify(LifecycleNotice::Terminated {
            transaction_id: transaction_id.clone(),
            outcome: Outcome::Committed,
        });
        OrchestratorMetrics::record_run("success");
        tracing::info!(
            orchestrator = %settings.name,
            %transaction_id,
            "Orchestrator run committed"
        );
        OrchestrateResult::succeeded(transaction_id, codec, current)
    }

    async fn run_stage(
        &self,
        transaction_id: &TransactionId,
        stage: &ErasedStage,
        phase: Phase,
        input: &[u8],
        context: &OrchestrateContext,
    ) -> Result<Vec<u8>, HandlerFailure> {
        let codec = self.settings.codec;
        let mut attempt = 0;
        let outcome = retry_with_predicate(
            &self.settings.retry,
            || {
                attempt += 1;
                self.notify(LifecycleNotice::HandlerInvoked {
                    transaction_id: transaction_id.clone(),
                    phase,
                    handler_id: stage.name.clone(),
                    attempt,
                });
                stage.run(input.to_vec(), codec, context.clone())
            },
            |failure: &HandlerFailure| {
                RetryClassifier::classify(failure, &stage.retry_exclusions)
                    == Classification::Retryable
            },
        )
        .await;

        if outcome.value.is_ok() {
            self.notify(LifecycleNotice::HandlerSucceeded {
                transaction_id: transaction_id.clone(),
                phase,
                handler_id: stage.name.clone(),
            });
        }
        outcome.value
    }

    /// Undo `executed` stages newest first and mark the run rolled back.
    async fn compensate(
        &self,
        slot: &TransactionSlot,
        transaction_id: &TransactionId,
        executed: Vec<(usize, Vec<u8>)>,
        context: &OrchestrateContext,
    ) -> Option<CompensationFailures> {
        slot.with(|tx| {
            if !tx.is_rolling_back() {
                let _ = tx.advance_to(Phase::Rollback);
            }
        });

        let policy = self.settings.compensation.retry_policy();
        let codec = self.settings.codec;
        let mut failures = CompensationFailures::new(transaction_id.clone());

        for (index, input) in executed.into_iter().rev() {
            let Some(stage) = self.stages.get(index) else {
                continue;
            };
            if !stage.compensates() {
                tracing::debug!(%transaction_id, stage = %stage.name, "Stage has no compensation");
                continue;
            }

            let outcome = retry_with_predicate(
                &policy,
                || {
                    let undo = stage.undo(input.clone(), codec, context.clone());
                    async move {
                        match undo {
                            Some(undo) => undo.await,
                            None => Ok(()),
                        }
                    }
                },
                |failure: &HandlerFailure| {
                    RetryClassifier::classify(failure, &stage.retry_exclusions)
                        == Classification::Retryable
                },
            )
            .await;

            match outcome.value {
                Ok(()) => {
                    tracing::info!(%transaction_id, stage = %stage.name, "Stage compensated");
                    self.notify(LifecycleNotice::Compensated {
                        transaction_id: transaction_id.clone(),
                        handler_id: stage.name.clone(),
                    });
                },
                Err(failure) => {
                    tracing::error!(
                        %transaction_id,
                        stage = %stage.name,
                        error = %failure,
                        "Stage compensation failed"
                    );
                    TransactionMetrics::record_compensation_failure();
                    let compensation = CompensationFailure {
                        handler_id: stage.name.clone(),
                        payload_type: None,
                        failure,
                        attempts: outcome.attempts,
                    };
                    self.notify(LifecycleNotice::CompensationFailed {
                        transaction_id: transaction_id.clone(),
                        failure: compensation.clone(),
                    });
                    failures.push(compensation);
                },
            }
        }

        let failures = (!failures.is_empty()).then_some(failures);
        self.mark_rolled_back(slot, transaction_id, failures.clone());
        failures
    }

    fn mark_rolled_back(
        &self,
        slot: &TransactionSlot,
        transaction_id: &TransactionId,
        failures: Option<CompensationFailures>,
    ) {
        slot.with(|tx| {
            if !tx.is_rolling_back() {
                let _ = tx.advance_to(Phase::Rollback);
            }
        });
        self.settings.registry.complete(
            transaction_id,
            Completion {
                outcome: Outcome::RolledBack,
                compensation_failures: failures,
            },
        );
        TransactionMetrics::record_terminated(Outcome::RolledBack);
        self.notify(LifecycleNotice::Terminated {
            transaction_id: transaction_id.clone(),
            outcome: Outcome::RolledBack,
        });
    }

    fn notify(&self, notice: LifecycleNotice) {
        self.settings.observer.notify(&notice);
    }
}

/// A run executing in the background.
///
/// Await it for the [`OrchestrateResult`]. [`cancel`](Self::cancel) stops
/// the run before its next stage and compensates what already ran.
pub struct OrchestrateHandle<Out> {
    task: JoinHandle<OrchestrateResult<Out>>,
    cancel: CancellationToken,
    transaction_id: TransactionId,
    codec: Codec,
}

impl<Out> OrchestrateHandle<Out> {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the run has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// The transaction id the run is tracked under.
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }
}

impl<Out> Future for OrchestrateHandle<Out> {
    type Output = OrchestrateResult<Out>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let transaction_id = self.transaction_id.clone();
        let codec = self.codec;
        Pin::new(&mut self.task).poll(cx).map(|joined| {
            joined.unwrap_or_else(|err| {
                OrchestrateResult::failed(
                    transaction_id,
                    codec,
                    SagaError::Internal(format!("orchestrator task failed: {err}")),
                    None,
                    None,
                )
            })
        })
    }
}

impl<Out> fmt::Debug for OrchestrateHandle<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrateHandle")
            .field("transaction_id", &self.transaction_id)
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}
