//! Prometheus metrics for expense-import-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "expense_import_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for import pipeline stages by outcome.
pub static IMPORT_STAGES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "expense_import_stages_total",
        "Total number of import pipeline stage executions",
        &["stage", "status"]
    )
    .expect("Failed to register IMPORT_STAGES")
});

/// Counter for cache lookups by relation and outcome.
pub static CACHE_LOOKUPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "expense_import_cache_lookups_total",
        "Total number of cache lookups",
        &["relation", "outcome"]
    )
    .expect("Failed to register CACHE_LOOKUPS")
});

/// Counter for AI calls by operation and outcome.
pub static AI_CALLS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "expense_import_ai_calls_total",
        "Total number of AI provider calls",
        &["operation", "outcome"]
    )
    .expect("Failed to register AI_CALLS")
});

/// Histogram for AI call latency.
pub static AI_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "expense_import_ai_call_duration_seconds",
        "AI provider call duration in seconds",
        &["operation"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("Failed to register AI_CALL_DURATION")
});

/// Counter for property matches by method.
pub static PROPERTY_MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "expense_import_property_matches_total",
        "Total number of resolved property identifiers",
        &["method"]
    )
    .expect("Failed to register PROPERTY_MATCHES")
});

/// Counter for committed expense rows.
pub static COMMITTED_ROWS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "expense_import_committed_rows_total",
        "Total number of expense rows written by imports",
        &["outcome"]
    )
    .expect("Failed to register COMMITTED_ROWS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "expense_import_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Recorder behind the `metrics` facade used by the shared HTTP middleware.
static HTTP_METRICS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&IMPORT_STAGES);
    Lazy::force(&CACHE_LOOKUPS);
    Lazy::force(&AI_CALLS);
    Lazy::force(&AI_CALL_DURATION);
    Lazy::force(&PROPERTY_MATCHES);
    Lazy::force(&COMMITTED_ROWS);
    Lazy::force(&ERRORS);

    if HTTP_METRICS.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = HTTP_METRICS.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install HTTP metrics recorder"),
        }
    }
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    let mut text = String::from_utf8(buffer).unwrap_or_default();
    if let Some(handle) = HTTP_METRICS.get() {
        text.push_str(&handle.render());
    }
    text
}

/// Record an import stage outcome.
pub fn record_import_stage(stage: &str, status: &str) {
    IMPORT_STAGES.with_label_values(&[stage, status]).inc();
}

/// Record a cache lookup.
pub fn record_cache_lookup(relation: &str, outcome: &str) {
    CACHE_LOOKUPS.with_label_values(&[relation, outcome]).inc();
}

/// Record an AI call and its latency.
pub fn record_ai_call(operation: &str, outcome: &str, duration_secs: f64) {
    AI_CALLS.with_label_values(&[operation, outcome]).inc();
    AI_CALL_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record a resolved identifier.
pub fn record_property_match(method: &str) {
    PROPERTY_MATCHES.with_label_values(&[method]).inc();
}

/// Record rows written (or skipped) by the reconciliation engine.
pub fn record_committed_rows(outcome: &str, rows: u64) {
    COMMITTED_ROWS
        .with_label_values(&[outcome])
        .inc_by(rows as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
