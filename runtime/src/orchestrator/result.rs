//! Result of an orchestrator run.

use sagaflow_core::codec::Codec;
use sagaflow_core::error::{CompensationFailures, SagaError};
use sagaflow_core::event::TransactionId;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, Clone)]
enum RunOutcome {
    Succeeded {
        output: Vec<u8>,
    },
    Failed {
        cause: SagaError,
        failed_stage: Option<String>,
        compensation_failures: Option<CompensationFailures>,
    },
}

/// How an orchestrator run ended.
///
/// Expected failures never surface as panics or `Err` from the run itself:
/// [`is_success`](Self::is_success) is `false` and the cause is available
/// through [`cause`](Self::cause).
pub struct OrchestrateResult<Out> {
    transaction_id: TransactionId,
    codec: Codec,
    outcome: RunOutcome,
    _output: PhantomData<fn() -> Out>,
}

impl<Out> OrchestrateResult<Out> {
    pub(crate) const fn succeeded(
        transaction_id: TransactionId,
        codec: Codec,
        output: Vec<u8>,
    ) -> Self {
        Self {
            transaction_id,
            codec,
            outcome: RunOutcome::Succeeded { output },
            _output: PhantomData,
        }
    }

    pub(crate) const fn failed(
        transaction_id: TransactionId,
        codec: Codec,
        cause: SagaError,
        failed_stage: Option<String>,
        compensation_failures: Option<CompensationFailures>,
    ) -> Self {
        Self {
            transaction_id,
            codec,
            outcome: RunOutcome::Failed {
                cause,
                failed_stage,
                compensation_failures,
            },
            _output: PhantomData,
        }
    }

    /// Whether every stage succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded { .. })
    }

    /// The transaction id the run was tracked under.
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Why the run failed.
    #[must_use]
    pub const fn cause(&self) -> Option<&SagaError> {
        match &self.outcome {
            RunOutcome::Succeeded { .. } => None,
            RunOutcome::Failed { cause, .. } => Some(cause),
        }
    }

    /// Name of the stage that failed, if a stage failed.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Failed { failed_stage, .. } => failed_stage.as_deref(),
            RunOutcome::Succeeded { .. } => None,
        }
    }

    /// Compensations that failed while undoing the run.
    #[must_use]
    pub const fn compensation_failures(&self) -> Option<&CompensationFailures> {
        match &self.outcome {
            RunOutcome::Failed {
                compensation_failures: Some(failures),
                ..
            } => Some(failures),
            _ => None,
        }
    }

    /// Decode the terminal payload into any compatible type.
    ///
    /// # Errors
    ///
    /// Returns the run's cause if it failed and [`SagaError::Decode`] if the
    /// payload is not a `U`.
    pub fn decode_result_as<U: DeserializeOwned>(&self) -> Result<U, SagaError> {
        match &self.outcome {
            RunOutcome::Succeeded { output } => Ok(self.codec.decode(output)?),
            RunOutcome::Failed { cause, .. } => Err(cause.clone()),
        }
    }
}

impl<Out: DeserializeOwned> OrchestrateResult<Out> {
    /// Decode the terminal payload as the pipeline's output type.
    ///
    /// # Errors
    ///
    /// Same as [`decode_result_as`](Self::decode_result_as).
    pub fn decode_result(&self) -> Result<Out, SagaError> {
        self.decode_result_as()
    }

    /// Convert into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Same as [`decode_result_as`](Self::decode_result_as).
    pub fn into_result(self) -> Result<Out, SagaError> {
        match self.outcome {
            RunOutcome::Succeeded { output } => Ok(self.codec.decode(&output)?),
            RunOutcome::Failed { cause, .. } => Err(cause),
        }
    }
}

impl<Out> Clone for OrchestrateResult<Out> {
    fn clone(&self) -> Self {
        Self {
            transaction_id: self.transaction_id.clone(),
            codec: self.codec,
            outcome: self.outcome.clone(),
            _output: PhantomData,
        }
    }
}

impl<Out> fmt::Debug for OrchestrateResult<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrateResult")
            .field("transaction_id", &self.transaction_id)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Wide {
        id: u32,
        label: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Narrow {
        id: u32,
    }

    #[test]
    fn success_decodes_to_compatible_shapes() {
        let bytes = Codec::Json.encode(&serde_json::json!({"id": 3, "label": "x"})).unwrap();
        let result: OrchestrateResult<Wide> =
            OrchestrateResult::succeeded("tx".into(), Codec::Json, bytes);

        assert!(result.is_success());
        assert_eq!(result.decode_result().unwrap().label, "x");
        assert_eq!(result.decode_result_as::<Narrow>().unwrap(), Narrow { id: 3 });
        assert!(matches!(result.decode_result_as::<Vec<u8>>(), Err(SagaError::Decode(_))));
    }

    #[test]
    fn failure_exposes_cause() {
        let result: OrchestrateResult<Wide> = OrchestrateResult::failed(
            "tx".into(),
            Codec::Json,
            SagaError::Cancelled("stopped".to_string()),
            Some("join".to_string()),
            None,
        );

        assert!(!result.is_success());
        assert_eq!(result.failed_stage(), Some("join"));
        assert!(result.compensation_failures().is_none());
        assert!(matches!(result.into_result(), Err(SagaError::Cancelled(_))));
    }
}
