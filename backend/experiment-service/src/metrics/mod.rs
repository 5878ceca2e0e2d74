/// Prometheus metrics for experiment assignment, events and results
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry,
    register_histogram_with_registry, CounterVec, Encoder, GaugeVec, Histogram, Registry,
    TextEncoder,
};

lazy_static! {
    /// Registry for all experiment metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ======================
    // Counters
    // ======================

    /// Assignment lookups (labels: outcome=new|sticky|ineligible)
    pub static ref ASSIGNMENTS_TOTAL: CounterVec = register_counter_vec_with_registry!(
        "experiment_assignments_total",
        "Total number of assignment lookups by outcome",
        &["outcome"],
        REGISTRY
    )
    .expect("Failed to register metric");

    /// Assignment cache lookups (labels: result=hit|miss|error)
    pub static ref ASSIGNMENT_CACHE_TOTAL: CounterVec = register_counter_vec_with_registry!(
        "experiment_assignment_cache_total",
        "Total number of assignment cache lookups",
        &["result"],
        REGISTRY
    )
    .expect("Failed to register metric");

    /// Recorded outcome events (labels: event_type)
    pub static ref EVENTS_TOTAL: CounterVec = register_counter_vec_with_registry!(
        "experiment_events_total",
        "Total number of recorded experiment events",
        &["event_type"],
        REGISTRY
    )
    .expect("Failed to register metric");

    /// Events that were not recorded (labels: reason=unassigned|closed)
    pub static ref EVENTS_DROPPED_TOTAL: CounterVec = register_counter_vec_with_registry!(
        "experiment_events_dropped_total",
        "Total number of experiment events that were not recorded",
        &["reason"],
        REGISTRY
    )
    .expect("Failed to register metric");

    // ======================
    // Histograms
    // ======================

    pub static ref RESULTS_DURATION_SECONDS: Histogram = register_histogram_with_registry!(
        "experiment_results_duration_seconds",
        "Time spent computing experiment results",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        REGISTRY
    )
    .expect("Failed to register metric");

    // ======================
    // Gauges
    // ======================

    /// Latest conversion rate per variant (labels: experiment, variant)
    pub static ref VARIANT_CONVERSION_RATE: GaugeVec = register_gauge_vec_with_registry!(
        "experiment_variant_conversion_rate",
        "Latest computed conversion rate per variant",
        &["experiment", "variant"],
        REGISTRY
    )
    .expect("Failed to register metric");
}

/// Encode every registered metric in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub mod helpers {
    use super::*;
    use crate::models::EventType;

    pub fn record_assignment(outcome: &str) {
        ASSIGNMENTS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn record_cache_lookup(result: &str) {
        ASSIGNMENT_CACHE_TOTAL.with_label_values(&[result]).inc();
    }

    /// Custom event names share one `custom` series
    pub fn record_event(event_type: &EventType) {
        let label = match event_type {
            EventType::Custom(_) => "custom",
            builtin => builtin.as_str(),
        };
        EVENTS_TOTAL.with_label_values(&[label]).inc();
    }

    pub fn record_dropped_event(reason: &str) {
        EVENTS_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn set_conversion_rate(experiment: &str, variant: &str, rate: f64) {
        VARIANT_CONVERSION_RATE
            .with_label_values(&[experiment, variant])
            .set(rate);
    }

    pub fn clear_conversion_rate(experiment: &str, variant: &str) {
        // Absent series are fine
        let _ = VARIANT_CONVERSION_RATE.remove_label_values(&[experiment, variant]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;

    #[test]
    fn test_gather_includes_experiment_metrics() {
        helpers::record_assignment("new");
        helpers::record_dropped_event("unassigned");

        let metrics = gather_metrics();
        assert!(metrics.contains("experiment_assignments_total"));
        assert!(metrics.contains("experiment_events_dropped_total"));
    }

    #[test]
    fn test_custom_event_types_share_one_series() {
        helpers::record_event(&EventType::from("checkout_step_7"));
        helpers::record_event(&EventType::from("checkout_step_8"));
        helpers::record_event(&EventType::Click);

        let metrics = gather_metrics();
        assert!(metrics.contains("event_type=\"custom\""));
        assert!(metrics.contains("event_type=\"click\""));
        assert!(!metrics.contains("checkout_step_7"));
    }

    #[test]
    fn test_cleared_conversion_rate_is_not_exported() {
        helpers::set_conversion_rate("gauge_cleanup", "control", 0.25);
        assert!(gather_metrics().contains("experiment=\"gauge_cleanup\""));

        helpers::clear_conversion_rate("gauge_cleanup", "control");
        helpers::clear_conversion_rate("gauge_cleanup", "never_set");
        assert!(!gather_metrics().contains("experiment=\"gauge_cleanup\""));
    }
}
