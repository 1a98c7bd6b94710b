//! Engine configuration.
//!
//! [`EngineConfig`] collects every tunable of the dispatcher, client API and
//! orchestrator. Build it in code with the `with_*` methods, or load it from
//! `SAGAFLOW_*` environment variables with [`EngineConfig::from_env`].
//!
//! | Variable | Default |
//! |---|---|
//! | `SAGAFLOW_TOPIC` | `sagaflow-transactions` |
//! | `SAGAFLOW_CONSUMER_GROUP` | `sagaflow` |
//! | `SAGAFLOW_NODE_NAME` | `node-<uuid>` |
//! | `SAGAFLOW_MAX_DELIVERY_ATTEMPTS` | `3` |
//! | `SAGAFLOW_VISIBILITY_TIMEOUT_MS` | `60000` |
//! | `SAGAFLOW_FAST_RECOVERY` | `false` (`true` sets the visibility timeout to 1000 ms) |
//! | `SAGAFLOW_CONSUMER_CONCURRENCY` | `4` |
//! | `SAGAFLOW_HANDLER_TIMEOUT_MS` | `10000` |
//! | `SAGAFLOW_TERMINATED_CACHE_CAPACITY` | `10000` |
//! | `SAGAFLOW_DLQ_CAPACITY` | `1000` |
//!
//! # Example
//!
//! ```no_run
//! use sagaflow_runtime::config::EngineConfig;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?
//!     .with_handler_timeout(Duration::from_secs(5));
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use sagaflow_core::codec::Codec;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Visibility timeout used when fast recovery is enabled.
pub const FAST_RECOVERY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds an unparsable value.
    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        /// The variable name
        var: &'static str,
        /// The raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// How compensating handlers are retried during rollback.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CompensationPolicy {
    /// Invoke each compensation once; failures go to the dead-letter queue.
    #[default]
    BestEffortOnce,
    /// Retry failed compensations with backoff before dead-lettering them.
    Retry(RetryPolicy),
}

impl CompensationPolicy {
    /// The retry policy this compensation policy implies.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::BestEffortOnce => RetryPolicy::once(),
            Self::Retry(policy) => policy.clone(),
        }
    }
}

/// Runtime configuration for the saga engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Topic carrying lifecycle events
    pub topic: String,
    /// Consumer group shared by every dispatcher of this application
    pub consumer_group: String,
    /// Name of this node (consumer name, event origin)
    pub node_name: String,
    /// Payload codec
    pub codec: Codec,
    /// Deliveries allowed before a retryable failure escalates to rollback
    pub max_delivery_attempts: u32,
    /// How long an unacknowledged event waits before redelivery
    pub visibility_timeout: Duration,
    /// Partition workers per dispatcher
    pub consumer_concurrency: usize,
    /// Bound on a single handler invocation
    pub handler_timeout: Duration,
    /// Recently terminated transactions remembered for duplicate detection
    pub terminated_cache_capacity: usize,
    /// Maximum number of dead letters kept
    pub dlq_capacity: usize,
    /// Retry behaviour of compensations
    pub compensation_policy: CompensationPolicy,
    /// Default bound on an orchestrator run
    pub orchestrator_timeout: Duration,
    /// Backoff between orchestrator stage attempts
    pub orchestrator_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            topic: "sagaflow-transactions".to_string(),
            consumer_group: "sagaflow".to_string(),
            node_name: default_node_name(),
            codec: Codec::Json,
            max_delivery_attempts: 3,
            visibility_timeout: Duration::from_secs(60),
            consumer_concurrency: 4,
            handler_timeout: Duration::from_secs(10),
            terminated_cache_capacity: 10_000,
            dlq_capacity: 1000,
            compensation_policy: CompensationPolicy::BestEffortOnce,
            orchestrator_timeout: Duration::from_secs(10),
            orchestrator_retry: RetryPolicy::default(),
        }
    }
}

fn default_node_name() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}

impl EngineConfig {
    /// Load configuration from `SAGAFLOW_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(topic) = lookup("SAGAFLOW_TOPIC") {
            config.topic = topic;
        }
        if let Some(group) = lookup("SAGAFLOW_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(node) = lookup("SAGAFLOW_NODE_NAME") {
            config.node_name = node;
        }
        if let Some(attempts) = parse(&lookup, "SAGAFLOW_MAX_DELIVERY_ATTEMPTS")? {
            config.max_delivery_attempts = attempts;
        }
        if let Some(ms) = parse(&lookup, "SAGAFLOW_VISIBILITY_TIMEOUT_MS")? {
            config.visibility_timeout = Duration::from_millis(ms);
        }
        if parse::<bool, _>(&lookup, "SAGAFLOW_FAST_RECOVERY")?.unwrap_or(false) {
            config.visibility_timeout = FAST_RECOVERY_TIMEOUT;
        }
        if let Some(concurrency) = parse(&lookup, "SAGAFLOW_CONSUMER_CONCURRENCY")? {
            config.consumer_concurrency = concurrency;
        }
        if let Some(ms) = parse(&lookup, "SAGAFLOW_HANDLER_TIMEOUT_MS")? {
            config.handler_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse(&lookup, "SAGAFLOW_TERMINATED_CACHE_CAPACITY")? {
            config.terminated_cache_capacity = capacity;
        }
        if let Some(capacity) = parse(&lookup, "SAGAFLOW_DLQ_CAPACITY")? {
            config.dlq_capacity = capacity;
        }

        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.topic.is_empty() {
            return invalid("topic cannot be empty");
        }
        if self.consumer_group.is_empty() {
            return invalid("consumer_group cannot be empty");
        }
        if self.node_name.is_empty() {
            return invalid("node_name cannot be empty");
        }
        if self.max_delivery_attempts == 0 {
            return invalid("max_delivery_attempts must be > 0");
        }
        if self.consumer_concurrency == 0 {
            return invalid("consumer_concurrency must be > 0");
        }
        if self.handler_timeout.is_zero() {
            return invalid("handler_timeout must be > 0");
        }
        if self.visibility_timeout.is_zero() {
            return invalid("visibility_timeout must be > 0");
        }
        if self.terminated_cache_capacity == 0 {
            return invalid("terminated_cache_capacity must be > 0");
        }
        if self.dlq_capacity == 0 {
            return invalid("dlq_capacity must be > 0");
        }
        Ok(())
    }

    /// Set the topic
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the consumer group
    #[must_use]
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the node name
    #[must_use]
    pub fn with_node_name(mut self, node: impl Into<String>) -> Self {
        self.node_name = node.into();
        self
    }

    /// Set the payload codec
    #[must_use]
    pub const fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the delivery attempts allowed before rollback
    #[must_use]
    pub const fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    /// Set the visibility timeout
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Shorten the visibility timeout for low-latency recovery
    #[must_use]
    pub const fn with_fast_recovery(mut self) -> Self {
        self.visibility_timeout = FAST_RECOVERY_TIMEOUT;
        self
    }

    /// Set the number of partition workers
    #[must_use]
    pub const fn with_consumer_concurrency(mut self, concurrency: usize) -> Self {
        self.consumer_concurrency = concurrency;
        self
    }

    /// Set the handler timeout
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the terminated-transaction cache capacity
    #[must_use]
    pub const fn with_terminated_cache_capacity(mut self, capacity: usize) -> Self {
        self.terminated_cache_capacity = capacity;
        self
    }

    /// Set the dead-letter queue capacity
    #[must_use]
    pub const fn with_dlq_capacity(mut self, capacity: usize) -> Self {
        self.dlq_capacity = capacity;
        self
    }

    /// Set the compensation policy
    #[must_use]
    pub fn with_compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = policy;
        self
    }

    /// Set the default orchestrator timeout
    #[must_use]
    pub const fn with_orchestrator_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator_timeout = timeout;
        self
    }

    /// Set the orchestrator stage retry policy
    #[must_use]
    pub fn with_orchestrator_retry(mut self, policy: RetryPolicy) -> Self {
        self.orchestrator_retry = policy;
        self
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
