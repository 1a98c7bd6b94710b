//! Prometheus metrics for the saga engine.
//!
//! Every component records through the `metrics` facade; nothing is
//! exported until a recorder is installed. [`MetricsServer`] installs the
//! Prometheus recorder and describes every metric:
//!
//! - Dispatch: events, handler failures, handler latency, duplicates
//! - Transactions: started, terminated, live
//! - Compensation and dead letters
//! - Orchestrator runs
//!
//! # Example
//!
//! ```rust,no_run
//! use sagaflow_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! println!("{}", server.render().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use sagaflow_core::phase::{Outcome, Phase};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder installer.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for the given scrape address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "saga_events_dispatched_total",
        "Events handed to the lifecycle dispatcher, by phase"
    );
    describe_counter!(
        "saga_handler_failures_total",
        "Handler failures, by phase and disposition (redeliver, rollback, drop)"
    );
    describe_histogram!("saga_handler_duration_seconds", "Time spent inside handlers, by phase");
    describe_counter!("saga_duplicates_ignored_total", "Redelivered or superseded events skipped");
    describe_counter!("saga_transactions_started_total", "Transactions opened by this process");
    describe_counter!("saga_transactions_terminated_total", "Transactions terminated, by outcome");
    describe_gauge!("saga_transactions_live", "Transactions currently in flight");
    describe_counter!("saga_compensation_failures_total", "Compensating actions that failed");
    describe_counter!("saga_dead_letters_total", "Compensations moved to the dead-letter queue");
    describe_gauge!("saga_dlq_size", "Current dead-letter queue size");
    describe_counter!("orchestrator_runs_total", "Orchestrator runs, by outcome");
}

/// Dispatcher metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record an event entering the dispatcher.
    pub fn record_dispatch(phase: Phase) {
        counter!("saga_events_dispatched_total", "phase" => phase.as_str()).increment(1);
    }

    /// Record time spent in a handler.
    pub fn record_handler(phase: Phase, duration: Duration) {
        histogram!("saga_handler_duration_seconds", "phase" => phase.as_str())
            .record(duration.as_secs_f64());
    }

    /// Record a handler failure and what was done about it.
    pub fn record_failure(phase: Phase, disposition: &'static str) {
        counter!(
            "saga_handler_failures_total",
            "phase" => phase.as_str(),
            "disposition" => disposition
        )
        .increment(1);
    }

    /// Record a skipped duplicate.
    pub fn record_duplicate() {
        counter!("saga_duplicates_ignored_total").increment(1);
    }
}

/// Transaction lifecycle metrics recorder.
pub struct TransactionMetrics;

impl TransactionMetrics {
    /// Record a transaction opened locally.
    pub fn record_started() {
        counter!("saga_transactions_started_total").increment(1);
    }

    /// Record a transaction reaching a terminal state.
    pub fn record_terminated(outcome: Outcome) {
        counter!("saga_transactions_terminated_total", "outcome" => outcome.as_str()).increment(1);
    }

    /// Record a failed compensation.
    pub fn record_compensation_failure() {
        counter!("saga_compensation_failures_total").increment(1);
    }
}

/// Orchestrator metrics recorder.
pub struct OrchestratorMetrics;

impl OrchestratorMetrics {
    /// Record a finished orchestrator run.
    pub fn record_run(outcome: &'static str) {
        counter!("orchestrator_runs_total", "outcome" => outcome).increment(1);
    }
}
