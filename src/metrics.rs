//! Control Plane Metrics
//!
//! Prometheus metrics registered into a registry owned by the orchestrator,
//! so several orchestrators (tests) never collide on metric names.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

/// Metrics for lifecycle operations, driver retries and pool capacity
#[derive(Debug, Clone)]
pub struct ControlPlaneMetrics {
    registry: Registry,
    /// Operations by `[operation, outcome]`
    operations: IntCounterVec,
    /// Transient driver failures retried, by `[backend, operation]`
    driver_retries: IntCounterVec,
    /// Requests for which no pool passed the filters
    scheduling_failures: IntCounter,
    /// Free capacity per pool as last seen by the scheduler
    pool_free_capacity_gb: GaugeVec,
    /// Operation latency by `[operation]`
    operation_duration: HistogramVec,
}

fn register_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl ControlPlaneMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("shareplane_operations_total", "Lifecycle operations by outcome"),
            &["operation", "outcome"],
        )
        .map_err(register_err)?;
        let driver_retries = IntCounterVec::new(
            Opts::new(
                "shareplane_driver_retries_total",
                "Driver calls retried after a transient failure",
            ),
            &["backend", "operation"],
        )
        .map_err(register_err)?;
        let scheduling_failures = IntCounter::new(
            "shareplane_scheduling_failures_total",
            "Requests with no valid host",
        )
        .map_err(register_err)?;
        let pool_free_capacity_gb = GaugeVec::new(
            Opts::new("shareplane_pool_free_capacity_gb", "Free capacity per pool"),
            &["host"],
        )
        .map_err(register_err)?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "shareplane_operation_duration_seconds",
                "Duration of lifecycle operations",
            ),
            &["operation"],
        )
        .map_err(register_err)?;

        registry.register(Box::new(operations.clone())).map_err(register_err)?;
        registry.register(Box::new(driver_retries.clone())).map_err(register_err)?;
        registry.register(Box::new(scheduling_failures.clone())).map_err(register_err)?;
        registry.register(Box::new(pool_free_capacity_gb.clone())).map_err(register_err)?;
        registry.register(Box::new(operation_duration.clone())).map_err(register_err)?;

        Ok(Self {
            registry,
            operations,
            driver_retries,
            scheduling_failures,
            pool_free_capacity_gb,
            operation_duration,
        })
    }

    /// Record the outcome and duration of an operation
    pub fn observe_operation(&self, operation: &str, ok: bool, elapsed_secs: f64) {
        let outcome = if ok { "success" } else { "failure" };
        self.operations.with_label_values(&[operation, outcome]).inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(elapsed_secs);
    }

    pub fn inc_driver_retry(&self, backend: &str, operation: &str) {
        self.driver_retries.with_label_values(&[backend, operation]).inc();
    }

    pub fn inc_scheduling_failure(&self) {
        self.scheduling_failures.inc();
    }

    pub fn set_pool_free(&self, host: &str, free_gb: f64) {
        self.pool_free_capacity_gb.with_label_values(&[host]).set(free_gb);
    }

    pub fn operation_count(&self, operation: &str, ok: bool) -> u64 {
        let outcome = if ok { "success" } else { "failure" };
        self.operations.with_label_values(&[operation, outcome]).get()
    }

    pub fn driver_retry_count(&self, backend: &str, operation: &str) -> u64 {
        self.driver_retries.with_label_values(&[backend, operation]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = ControlPlaneMetrics::new().unwrap();
        metrics.observe_operation("create_share", true, 0.5);
        metrics.inc_driver_retry("zfs1", "create_share");
        metrics.set_pool_free("zfs1#tank", 42.0);

        assert_eq!(metrics.operation_count("create_share", true), 1);
        assert_eq!(metrics.driver_retry_count("zfs1", "create_share"), 1);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("shareplane_operations_total"));
        assert!(text.contains("zfs1#tank"));
    }

    #[test]
    fn test_independent_registries() {
        let a = ControlPlaneMetrics::new().unwrap();
        let b = ControlPlaneMetrics::new().unwrap();
        a.inc_scheduling_failure();
        assert!(b.encode_text().unwrap().contains("shareplane_scheduling_failures_total 0"));
    }
}
