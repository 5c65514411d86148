//! Prometheus metrics registry for control plane operations.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Orchestration operation labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
    pub outcome: String,
}

/// Change event labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChangeEventLabels {
    pub event: String,
}

/// Metrics registry holding all control plane metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    pub operations_total: Family<OperationLabels, Counter>,
    pub change_events_total: Family<ChangeEventLabels, Counter>,
    pub fan_out_targets_total: Counter,
    pub fan_out_failures_total: Counter,
    pub binding_refresh_failures_total: Counter,
    pub audit_write_failures_total: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let operations_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "fogplane_operations",
            "Total number of orchestration operations by outcome",
            operations_total.clone(),
        );

        let change_events_total = Family::<ChangeEventLabels, Counter>::default();
        registry.register(
            "fogplane_change_events",
            "Total number of agent change events recorded",
            change_events_total.clone(),
        );

        let fan_out_targets_total = Counter::default();
        registry.register(
            "fogplane_fan_out_targets",
            "Total number of tag fan-out targets visited",
            fan_out_targets_total.clone(),
        );

        let fan_out_failures_total = Counter::default();
        registry.register(
            "fogplane_fan_out_failures",
            "Total number of tag fan-out targets that could not be updated",
            fan_out_failures_total.clone(),
        );

        let binding_refresh_failures_total = Counter::default();
        registry.register(
            "fogplane_binding_refresh_failures",
            "Total number of dependent host bindings that failed to re-resolve",
            binding_refresh_failures_total.clone(),
        );

        let audit_write_failures_total = Counter::default();
        registry.register(
            "fogplane_audit_write_failures",
            "Total number of audit events that could not be persisted",
            audit_write_failures_total.clone(),
        );

        Self {
            registry,
            operations_total,
            change_events_total,
            fan_out_targets_total,
            fan_out_failures_total,
            binding_refresh_failures_total,
            audit_write_failures_total,
        }
    }

    /// Record the outcome of an orchestration operation.
    pub fn record_operation(&self, operation: &str, success: bool) {
        let labels = OperationLabels {
            operation: operation.to_string(),
            outcome: if success { "success" } else { "error" }.to_string(),
        };
        self.operations_total.get_or_create(&labels).inc();
    }

    /// Record a change event applied to an agent.
    pub fn record_change_event(&self, event: &str) {
        let labels = ChangeEventLabels {
            event: event.to_string(),
        };
        self.change_events_total.get_or_create(&labels).inc();
    }

    /// Record the result of a fan-out pass.
    pub fn record_fan_out(&self, targets: u64, failures: u64) {
        self.fan_out_targets_total.inc_by(targets);
        self.fan_out_failures_total.inc_by(failures);
    }

    /// Record a dependent binding that failed to re-resolve.
    pub fn record_binding_refresh_failure(&self) {
        self.binding_refresh_failures_total.inc();
    }

    /// Record an audit write that was dropped.
    pub fn record_audit_write_failure(&self) {
        self.audit_write_failures_total.inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
