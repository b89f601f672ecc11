//! Prometheus metrics for lifecycle calls and connection dialing
//!
//! # Available Metrics
//!
//! - `command_lifecycle_operations_total{operation, status}` - Counter of create/update/delete/run calls
//! - `command_dial_attempts_total{role, outcome}` - Counter of SSH dial attempts (role: target/proxy)
//! - `command_script_duration_seconds{operation}` - Histogram of script run time
//! - `command_active_operations` - Gauge of calls currently in flight
//!
//! Metrics are rendered in the Prometheus text format with [`ProviderMetrics::gather`];
//! the CLI writes them to a file when `--metrics-file` is given.
//!
//! # Example
//!
//! ```
//! use command_provider::metrics::ProviderMetrics;
//!
//! let metrics = ProviderMetrics::new().unwrap();
//! metrics.record_operation("create", "success", 0.25);
//! assert!(metrics.gather().unwrap().contains("command_lifecycle_operations_total"));
//! ```

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Histogram bucket boundaries for script duration metrics (in seconds)
const SCRIPT_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Registry of provider metrics
#[derive(Clone)]
pub struct ProviderMetrics {
    registry: Arc<Registry>,
    operations: Arc<CounterVec>,
    dial_attempts: Arc<CounterVec>,
    script_duration: Arc<HistogramVec>,
    active_operations: Arc<Gauge>,
}

impl ProviderMetrics {
    /// Create a registry with all provider metrics registered
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let operations = CounterVec::new(
            Opts::new(
                "command_lifecycle_operations_total",
                "Total number of lifecycle calls",
            ),
            &["operation", "status"],
        )?;

        let dial_attempts = CounterVec::new(
            Opts::new("command_dial_attempts_total", "Total number of SSH dial attempts"),
            &["role", "outcome"],
        )?;

        let script_duration = HistogramVec::new(
            HistogramOpts::new(
                "command_script_duration_seconds",
                "Script execution duration in seconds",
            )
            .buckets(SCRIPT_DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;

        let active_operations = Gauge::with_opts(Opts::new(
            "command_active_operations",
            "Lifecycle calls in flight",
        ))?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(dial_attempts.clone()))?;
        registry.register(Box::new(script_duration.clone()))?;
        registry.register(Box::new(active_operations.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            operations: Arc::new(operations),
            dial_attempts: Arc::new(dial_attempts),
            script_duration: Arc::new(script_duration),
            active_operations: Arc::new(active_operations),
        })
    }

    /// Record a finished lifecycle call
    ///
    /// # Arguments
    ///
    /// * `operation` - "create", "update", "delete" or "run"
    /// * `status` - "success" or "failed"
    /// * `duration_secs` - Time spent running the script
    pub fn record_operation(&self, operation: &str, status: &str, duration_secs: f64) {
        self.operations
            .with_label_values(&[operation, status])
            .inc();
        self.script_duration
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    /// Record one dial attempt ("target"/"proxy", "success"/"failure")
    pub fn record_dial_attempt(&self, role: &str, outcome: &str) {
        self.dial_attempts.with_label_values(&[role, outcome]).inc();
    }

    pub fn inc_active_operations(&self) {
        self.active_operations.inc();
    }

    pub fn dec_active_operations(&self) {
        self.active_operations.dec();
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operation() {
        let metrics = ProviderMetrics::new().unwrap();
        metrics.record_operation("create", "success", 1.5);
        metrics.record_operation("create", "failed", 0.1);

        let text = metrics.gather().unwrap();
        assert!(text.contains("command_lifecycle_operations_total{operation=\"create\",status=\"success\"} 1"));
        assert!(text.contains("command_script_duration_seconds_count{operation=\"create\"} 2"));
    }

    #[test]
    fn test_record_dial_attempt() {
        let metrics = ProviderMetrics::new().unwrap();
        metrics.record_dial_attempt("proxy", "failure");
        metrics.record_dial_attempt("proxy", "failure");

        let text = metrics.gather().unwrap();
        assert!(text.contains("command_dial_attempts_total{outcome=\"failure\",role=\"proxy\"} 2"));
    }

    #[test]
    fn test_active_operations() {
        let metrics = ProviderMetrics::new().unwrap();
        metrics.inc_active_operations();
        metrics.inc_active_operations();
        metrics.dec_active_operations();

        let text = metrics.gather().unwrap();
        assert!(text.contains("command_active_operations 1"));
    }
}
