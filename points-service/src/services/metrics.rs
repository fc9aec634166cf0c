//! Prometheus metrics for points-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

use super::ServiceError;

/// HTTP request counter by method, matched route and status.
pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "points_http_requests_total",
        "Total number of HTTP requests",
        &["method", "route", "status"]
    )
    .expect("Failed to register http_requests_total")
});

/// HTTP request duration histogram by method and matched route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "points_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register http_request_duration")
});

/// OAuth grant outcomes.
pub static GRANTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "points_grants_total",
        "Total number of OAuth grant operations",
        &["grant", "outcome"] // authorization_code|refresh_token|code_issued|revoke, ok|error code
    )
    .expect("Failed to register grants_total")
});

/// Ledger mutation outcomes (no member or client labels).
pub static LEDGER_MUTATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "points_ledger_mutations_total",
        "Total number of ledger mutations by method and outcome",
        &["method", "outcome"]
    )
    .expect("Failed to register ledger_mutations_total")
});

/// Store operation duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "points_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Pending gated debits moved to `expired` by the sweeper.
pub static EXPIRED_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "points_expired_requests_total",
        "Total number of redemption requests expired",
        &["source"] // sweep, approval
    )
    .expect("Failed to register expired_requests_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&GRANTS_TOTAL);
    Lazy::force(&LEDGER_MUTATIONS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&EXPIRED_REQUESTS_TOTAL);
}

/// Count an operation outcome: `ok` or the error's envelope code.
pub fn record_outcome<T>(counter: &CounterVec, label: &str, result: &Result<T, ServiceError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    counter.with_label_values(&[label, outcome]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
