//! Engine metrics
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! embedding binary.

use std::time::Duration;

/// Record a statement that returned rows
pub fn record_statement_success(duration: Duration) {
    metrics::counter!("quarry_statements_total", "status" => "ok").increment(1);
    metrics::histogram!("quarry_statement_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed statement
pub fn record_statement_failure(error_kind: &str, duration: Duration) {
    metrics::counter!(
        "quarry_statements_total",
        "status" => "error",
        "error_type" => error_kind.to_string(),
    )
    .increment(1);
    metrics::histogram!("quarry_statement_duration_seconds").record(duration.as_secs_f64());
}

/// Record an aggregation subtree that was dropped or rendered null
pub fn record_aggregation_dropped(reason: &str) {
    metrics::counter!(
        "quarry_aggregations_dropped_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record how many statements a request was planned into
pub fn record_planned_statements(total: usize, merged: usize) {
    metrics::histogram!("quarry_planned_statements").record(total as f64);
    if merged > 0 {
        metrics::counter!("quarry_merged_statements_total").increment(merged as u64);
    }
}

/// Record the phase a search request finished in
pub fn record_request_finished(phase: &str, duration: Duration) {
    metrics::counter!(
        "quarry_requests_total",
        "phase" => phase.to_string(),
    )
    .increment(1);
    metrics::histogram!("quarry_request_duration_seconds").record(duration.as_secs_f64());
}
