//! Prometheus text exposition format rendering.
//!
//! The control plane exposes metrics at `/metrics` in Prometheus text format.

use crate::MetricsRegistry;
use prometheus_client::encoding::text::encode;

/// Content-Type header value for Prometheus text format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render the metrics registry to Prometheus text format.
pub fn render_metrics(registry: &MetricsRegistry) -> String {
    let mut buffer = String::new();
    encode(&mut buffer, &registry.registry).expect("encoding metrics should not fail");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_metrics_empty() {
        let registry = MetricsRegistry::new();
        let output = render_metrics(&registry);

        // Metric definitions are present even without samples
        assert!(output.contains("fogplane_operations"));
        assert!(output.contains("fogplane_fan_out_failures"));
    }

    #[test]
    fn test_render_metrics_with_data() {
        let registry = MetricsRegistry::new();

        registry.record_change_event("microservice_full");
        registry.record_fan_out(2, 1);

        let output = render_metrics(&registry);

        assert!(output.contains("event=\"microservice_full\""));
        assert!(output.contains("fogplane_fan_out_failures_total 1"));
    }
}
