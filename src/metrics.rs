//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Source pulls and mapping outcomes per partition
//! - Publish throughput, latency and failures
//! - Cursor persistence
//! - Sequence checkpoints
//! - Worker and supervisor state
//! - Bootstrap requests
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `reactivator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Worker Metrics
// =============================================================================

/// Record raw events returned by a source pull.
pub fn record_events_pulled(partition: &str, count: usize) {
    counter!("reactivator_events_pulled_total", "partition" => partition.to_string())
        .increment(count as u64);
}

/// Record a raw event skipped because it could not be mapped.
pub fn record_mapping_skipped(partition: &str) {
    counter!("reactivator_mapping_skipped_total", "partition" => partition.to_string()).increment(1);
}

/// Record a successful publish of `count` notifications.
pub fn record_events_published(partition: &str, count: usize, latency: Duration) {
    counter!("reactivator_events_published_total", "partition" => partition.to_string())
        .increment(count as u64);
    histogram!("reactivator_publish_latency_seconds", "partition" => partition.to_string())
        .record(latency.as_secs_f64());
}

/// Record a failed publish attempt.
pub fn record_publish_failure(partition: &str) {
    counter!("reactivator_publish_failures_total", "partition" => partition.to_string()).increment(1);
}

/// Record a failed source pull.
pub fn record_source_error(partition: &str) {
    counter!("reactivator_source_errors_total", "partition" => partition.to_string()).increment(1);
}

/// Record cursor persistence outcome.
pub fn record_cursor_persist(partition: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "reactivator_cursor_persist_total",
        "partition" => partition.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a SQLite busy retry.
pub fn cursor_retries_total(operation: &str) {
    counter!("reactivator_cursor_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for a worker's state (0=loading, 1=streaming, 2=stopped, 3=faulted).
pub fn set_worker_state(partition: &str, state: &str) {
    let value = match state {
        "Loading" => 0.0,
        "Streaming" => 1.0,
        "Stopped" => 2.0,
        "Faulted" => 3.0,
        _ => -1.0,
    };
    gauge!("reactivator_worker_state", "partition" => partition.to_string()).set(value);
}

// =============================================================================
// Process Metrics
// =============================================================================

/// Record a sequence checkpoint.
pub fn record_sequence_flush(value: u64) {
    counter!("reactivator_sequence_flushes_total").increment(1);
    gauge!("reactivator_sequence_checkpoint").set(value as f64);
}

/// Gauge for supervisor state.
pub fn set_supervisor_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("reactivator_supervisor_state").set(value);
}

/// Record a worker abandoned at shutdown.
pub fn record_worker_abandoned(partition: &str) {
    counter!("reactivator_workers_abandoned_total", "partition" => partition.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "reactivator_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Bootstrap / Control Plane Metrics
// =============================================================================

/// Record a completed or failed acquire.
pub fn record_bootstrap(success: bool, entities: usize, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("reactivator_bootstrap_requests_total", "status" => status).increment(1);
    if success {
        counter!("reactivator_bootstrap_entities_total").increment(entities as u64);
    }
    histogram!("reactivator_bootstrap_duration_seconds").record(duration.as_secs_f64());
}

/// Record a subscription control event.
pub fn record_control_event(op: &str) {
    counter!("reactivator_control_events_total", "op" => op.to_string()).increment(1);
}
