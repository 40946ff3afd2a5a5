//! Metrics for the generation orchestrator.
//!
//! Prometheus counters/gauges/histograms via the `metrics` crate, plus
//! small in-process sample windows that back the reconciler alert logic
//! (p95 pending age, delivery success rate, orphan growth).

pub mod dedupe;
pub mod delivery;
pub mod window;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const JOBS_TOTAL: &str = "gen_jobs_total";
    pub const PHASE_DURATION: &str = "gen_phase_duration_seconds";
    pub const PROVIDER_REQUESTS: &str = "kie_provider_requests_total";
    pub const BREAKER_STATE: &str = "kie_circuit_breaker_state";
    pub const LOCK_FALLBACKS: &str = "lock_inprocess_fallbacks_total";
    pub const PENDING_AGE: &str = "delivery_pending_age_seconds";
    pub const DELIVERIES: &str = "delivery_attempts_total";
    pub const ORPHAN_COUNT: &str = "dedupe_orphan_count";
    pub const URL_REPAIRS: &str = "result_url_repairs_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Call once at application startup; subsequent calls return the same handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle, if initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Record a finished job by terminal outcome (`completed`, `failed`, ...).
pub fn record_job_outcome(model_id: &str, outcome: &str) {
    counter!(
        names::JOBS_TOTAL,
        "model" => model_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the duration of an engine phase (`KIE_CREATE`, `KIE_POLL`, ...).
pub fn record_phase_duration(action: &str, duration: Duration) {
    histogram!(
        names::PHASE_DURATION,
        "action" => action.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a provider call by operation and outcome.
pub fn record_provider_request(operation: &str, outcome: &str) {
    counter!(
        names::PROVIDER_REQUESTS,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Publish the circuit breaker state (0 = closed, 1 = half-open, 2 = open).
pub fn set_breaker_state(state: u8) {
    gauge!(names::BREAKER_STATE).set(state as f64);
}

/// Record a distributed-lock degradation to the in-process mutex.
pub fn record_lock_fallback(reason: &str) {
    counter!(
        names::LOCK_FALLBACKS,
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a repaired result URL with the stable repair code.
pub fn record_url_repair(code: &str) {
    counter!(
        names::URL_REPAIRS,
        "code" => code.to_string()
    )
    .increment(1);
}
