//! Engine assembly.
//!
//! [`SagaEngine`] wires one event log, one handler registry and one
//! transaction registry into a [`SagaManager`] and a [`LifecycleDispatcher`]
//! that share state.
//!
//! # Example
//!
//! ```ignore
//! let engine = SagaEngine::builder(log)
//!     .with_config(EngineConfig::from_env()?)
//!     .register(start_handler)
//!     .register(join_handler)
//!     .build()?;
//!
//! let shutdown = CancellationToken::new();
//! let worker = engine.spawn(shutdown.clone());
//! let id = engine.manager().start(&Order { id: 7 }).await?;
//! ```

use crate::config::EngineConfig;
use crate::dead_letter::{CompensationTask, DeadLetterQueue};
use crate::dispatcher::LifecycleDispatcher;
use crate::handler::{HandlerRegistration, HandlerRegistry};
use crate::manager::SagaManager;
use crate::observer::{LifecycleObserver, TracingObserver};
use crate::registry::TransactionRegistry;
use sagaflow_core::environment::{Clock, IdGenerator, SystemClock, UuidGenerator};
use sagaflow_core::error::SagaError;
use sagaflow_core::event_log::EventLog;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A configured saga engine.
#[derive(Debug, Clone)]
pub struct SagaEngine {
    manager: SagaManager,
    dispatcher: LifecycleDispatcher,
    registry: Arc<TransactionRegistry>,
}

impl SagaEngine {
    /// Start building an engine on top of `log`.
    #[must_use]
    pub fn builder(log: Arc<dyn EventLog>) -> SagaEngineBuilder {
        SagaEngineBuilder {
            log,
            config: EngineConfig::default(),
            observer: Arc::new(TracingObserver),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            registrations: Vec::new(),
        }
    }

    /// Client API.
    #[must_use]
    pub const fn manager(&self) -> &SagaManager {
        &self.manager
    }

    /// The dispatcher consuming the log.
    #[must_use]
    pub const fn dispatcher(&self) -> &LifecycleDispatcher {
        &self.dispatcher
    }

    /// Live and recently terminated transactions.
    #[must_use]
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Compensations that failed for good.
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterQueue<CompensationTask> {
        self.dispatcher.dead_letters()
    }

    /// Run the dispatcher on the current runtime until `cancel` fires.
    #[must_use]
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    }
}

/// Builder for [`SagaEngine`].
pub struct SagaEngineBuilder {
    log: Arc<dyn EventLog>,
    config: EngineConfig,
    observer: Arc<dyn LifecycleObserver>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    registrations: Vec<HandlerRegistration>,
}

impl SagaEngineBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Report lifecycle notices to `observer` (default: [`TracingObserver`]).
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Allocate transaction ids with `ids`.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Add a handler.
    #[must_use]
    pub fn register(mut self, registration: HandlerRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Validate the configuration and registrations and assemble the engine.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::InvalidRegistration`] for conflicting handlers
    /// and [`SagaError::Internal`] for an invalid configuration.
    pub fn build(self) -> Result<SagaEngine, SagaError> {
        self.config.validate().map_err(|err| {
            tracing::error!(error = %err, "Invalid engine configuration");
            SagaError::Internal(err.to_string())
        })?;

        let mut handlers = HandlerRegistry::new();
        for registration in self.registrations {
            handlers.register(registration)?;
        }

        let registry = Arc::new(TransactionRegistry::new(self.config.terminated_cache_capacity));
        let dispatcher = LifecycleDispatcher::new(
            Arc::clone(&self.log),
            Arc::clone(&registry),
            Arc::new(handlers),
            self.config.clone(),
            Arc::clone(&self.observer),
            Arc::clone(&self.clock),
        );
        let manager = SagaManager::new(
            self.log,
            Arc::clone(&registry),
            self.config,
            self.ids,
            self.clock,
            self.observer,
        );

        Ok(SagaEngine {
            manager,
            dispatcher,
            registry,
        })
    }
}

impl std::fmt::Debug for SagaEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEngineBuilder")
            .field("config", &self.config)
            .field("registrations", &self.registrations.len())
            .finish_non_exhaustive()
    }
}
