//! # Sagaflow Runtime
//!
//! Runtime implementation for the Sagaflow saga engine.
//!
//! This crate drives transactions through their lifecycle on top of an
//! [`EventLog`](sagaflow_core::event_log::EventLog): a client API that
//! appends lifecycle events, a dispatcher that consumes them and invokes
//! registered handlers, and an in-process orchestrator for pipelines that
//! don't need a log at all.
//!
//! ## Core Components
//!
//! - **`SagaManager`**: start, join, commit and roll back transactions
//! - **`LifecycleDispatcher`**: consume events, invoke handlers, decide outcomes
//! - **`HandlerRegistry`**: handlers keyed by phase and payload type
//! - **`TransactionRegistry`**: live transaction state and completion signals
//! - **`Orchestrator`**: typed start → join* → commit pipelines with compensation
//!
//! ## Example
//!
//! ```ignore
//! use sagaflow_runtime::{HandlerRegistration, SagaEngine, SuccessWith};
//!
//! let engine = SagaEngine::builder(log)
//!     .register(
//!         HandlerRegistration::on_start::<Order>()
//!             .success_with(SuccessWith::PublishJoin)
//!             .handle_sync(|_event| Ok(())),
//!     )
//!     .build()?;
//!
//! let worker = engine.spawn(shutdown.clone());
//! let id = engine.manager().start(&Order { id: 7 }).await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Failure classification against exclusion sets
pub mod classifier;

/// Engine configuration
pub mod config;

/// Dead letter queue for compensations that failed for good
pub mod dead_letter;

/// Event consumption and outcome decisions
pub mod dispatcher;

/// Engine assembly
pub mod engine;

/// Handler registrations and the handler registry
pub mod handler;

/// Client API
pub mod manager;

/// Prometheus metrics for observability
pub mod metrics;

/// Lifecycle notices
pub mod observer;

/// In-process orchestrator pipelines
pub mod orchestrator;

/// Live transaction state
pub mod registry;

pub use classifier::{Classification, FailureDisposition, RetryClassifier};
pub use config::{CompensationPolicy, ConfigError, EngineConfig};
pub use dead_letter::{CompensationTask, DeadLetter, DeadLetterQueue};
pub use dispatcher::{LifecycleDispatcher, OutcomeDecision};
pub use engine::{SagaEngine, SagaEngineBuilder};
pub use handler::{
    HandlerBuilder, HandlerOutputs, HandlerRegistration, HandlerRegistry, PhaseEvent, SuccessWith,
};
pub use manager::{AppendHandle, SagaManager};
pub use observer::{LifecycleNotice, LifecycleObserver, NoOpObserver, TracingObserver};
pub use orchestrator::{
    OrchestrateContext, OrchestrateHandle, OrchestrateResult, Orchestrator, Stage,
};
pub use registry::{Completion, TransactionRegistry};
pub use retry::{RetryPolicy, retry_with_backoff};
