//! Orchestrator stages.
//!
//! A [`Stage<I, O>`] pairs a forward function turning an `I` into an `O`
//! with an optional compensating function that undoes it given the same
//! `I`. Once added to a pipeline a stage is type-erased: values cross stage
//! boundaries as codec-encoded bytes.

use super::context::OrchestrateContext;
use futures::future::BoxFuture;
use sagaflow_core::codec::Codec;
use sagaflow_core::failure::{FailureKind, FailureKindSet, HandlerFailure};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

type StageFuture<T> = BoxFuture<'static, Result<T, HandlerFailure>>;

type ForwardFn =
    Arc<dyn Fn(Vec<u8>, Codec, OrchestrateContext) -> StageFuture<Vec<u8>> + Send + Sync>;

type CompensateFn =
    Arc<dyn Fn(Vec<u8>, Codec, OrchestrateContext) -> StageFuture<()> + Send + Sync>;

/// One forward/compensate pair of an orchestrator pipeline.
///
/// # Example
///
/// ```
/// use sagaflow_core::failure::{FailureKind, HandlerFailure};
/// use sagaflow_runtime::orchestrator::Stage;
///
/// let reserve = Stage::new(|quantity: u32, _ctx| async move {
///     if quantity == 0 {
///         return Err(HandlerFailure::validation("nothing to reserve"));
///     }
///     Ok(format!("reservation-{quantity}"))
/// })
/// .named("reserve")
/// .skip_retry_for([FailureKind::Validation])
/// .compensate_sync(|_quantity: u32, _ctx| Ok(()));
///
/// assert_eq!(reserve.name(), Some("reserve"));
/// ```
pub struct Stage<I, O> {
    name: Option<String>,
    forward: ForwardFn,
    compensate: Option<CompensateFn>,
    retry_exclusions: FailureKindSet,
    rollback_exclusions: FailureKindSet,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> Stage<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    /// A stage with an asynchronous forward function.
    #[must_use]
    pub fn new<F, Fut>(forward: F) -> Self
    where
        F: Fn(I, OrchestrateContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerFailure>> + Send + 'static,
    {
        let forward: ForwardFn = Arc::new(
            move |bytes: Vec<u8>, codec: Codec, ctx: OrchestrateContext| -> StageFuture<Vec<u8>> {
                match codec.decode::<I>(&bytes) {
                    Ok(input) => {
                        let output = forward(input, ctx);
                        Box::pin(async move {
                            let output = output.await?;
                            codec.encode(&output).map_err(HandlerFailure::from)
                        })
                    },
                    Err(err) => Box::pin(std::future::ready(Err(HandlerFailure::from(err)))),
                }
            },
        );
        Self::from_forward(forward)
    }

    /// A stage with a synchronous forward function.
    #[must_use]
    pub fn sync<F>(forward: F) -> Self
    where
        F: Fn(I, &OrchestrateContext) -> Result<O, HandlerFailure> + Send + Sync + 'static,
    {
        let forward: ForwardFn = Arc::new(
            move |bytes: Vec<u8>, codec: Codec, ctx: OrchestrateContext| -> StageFuture<Vec<u8>> {
                let result = codec
                    .decode::<I>(&bytes)
                    .map_err(HandlerFailure::from)
                    .and_then(|input| forward(input, &ctx))
                    .and_then(|output| codec.encode(&output).map_err(HandlerFailure::from));
                Box::pin(std::future::ready(result))
            },
        );
        Self::from_forward(forward)
    }

    fn from_forward(forward: ForwardFn) -> Self {
        Self {
            name: None,
            forward,
            compensate: None,
            retry_exclusions: FailureKindSet::new(),
            rollback_exclusions: FailureKindSet::new(),
            _types: PhantomData,
        }
    }

    /// Undo this stage with an asynchronous function of the stage's input.
    #[must_use]
    pub fn compensate<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(I, OrchestrateContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerFailure>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(
            move |bytes: Vec<u8>, codec: Codec, ctx: OrchestrateContext| -> StageFuture<()> {
                match codec.decode::<I>(&bytes) {
                    Ok(input) => Box::pin(compensate(input, ctx)),
                    Err(err) => Box::pin(std::future::ready(Err(HandlerFailure::from(err)))),
                }
            },
        ));
        self
    }

    /// Undo this stage with a synchronous function of the stage's input.
    #[must_use]
    pub fn compensate_sync<F>(mut self, compensate: F) -> Self
    where
        F: Fn(I, &OrchestrateContext) -> Result<(), HandlerFailure> + Send + Sync + 'static,
    {
        self.compensate = Some(Arc::new(
            move |bytes: Vec<u8>, codec: Codec, ctx: OrchestrateContext| -> StageFuture<()> {
                let result = codec
                    .decode::<I>(&bytes)
                    .map_err(HandlerFailure::from)
                    .and_then(|input| compensate(input, &ctx));
                Box::pin(std::future::ready(result))
            },
        ));
        self
    }
}

impl<I, O> Stage<I, O> {
    /// Name the stage in logs, notices and results.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Fail without retrying on these kinds (or their descendants).
    #[must_use]
    pub fn skip_retry_for(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_exclusions.extend(kinds);
        self
    }

    /// End the run without compensation on these kinds (or their descendants).
    #[must_use]
    pub fn skip_rollback_for(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.rollback_exclusions.extend(kinds);
        self
    }

    /// The stage name, if one was given.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn erase(self, default_name: String) -> ErasedStage {
        ErasedStage {
            name: self.name.unwrap_or(default_name),
            forward: self.forward,
            compensate: self.compensate,
            retry_exclusions: self.retry_exclusions,
            rollback_exclusions: self.rollback_exclusions,
        }
    }
}

impl<I, O> fmt::Debug for Stage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("compensates", &self.compensate.is_some())
            .field("retry_exclusions", &self.retry_exclusions)
            .field("rollback_exclusions", &self.rollback_exclusions)
            .finish_non_exhaustive()
    }
}

/// A stage with its types erased.
pub(crate) struct ErasedStage {
    pub(crate) name: String,
    forward: ForwardFn,
    compensate: Option<CompensateFn>,
    pub(crate) retry_exclusions: FailureKindSet,
    pub(crate) rollback_exclusions: FailureKindSet,
}

impl ErasedStage {
    pub(crate) fn run(
        &self,
        input: Vec<u8>,
        codec: Codec,
        context: OrchestrateContext,
    ) -> StageFuture<Vec<u8>> {
        (self.forward)(input, codec, context)
    }

    pub(crate) fn undo(
        &self,
        input: Vec<u8>,
        codec: Codec,
        context: OrchestrateContext,
    ) -> Option<StageFuture<()>> {
        self.compensate
            .as_ref()
            .map(|compensate| compensate(input, codec, context))
    }

    pub(crate) const fn compensates(&self) -> bool {
        self.compensate.is_some()
    }
}

impl fmt::Debug for ErasedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedStage")
            .field("name", &self.name)
            .field("compensates", &self.compensate.is_some())
            .finish_non_exhaustive()
    }
}
