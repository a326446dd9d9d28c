//! Prometheus metrics
//!
//! Counters and histograms recorded by the pool, executors and session
//! manager. Recording is a no-op until `init_metrics` installs a recorder.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Install the Prometheus recorder (idempotent) and return a render handle
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    METRICS_HANDLE
        .get_or_try_init(|| {
            PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Full("pysandbox_execution_duration_seconds".to_string()),
                    DURATION_BUCKETS,
                )?
                .install_recorder()
        })
        .cloned()
}

/// Render the current snapshot, if a recorder was installed
pub fn render() -> Option<String> {
    METRICS_HANDLE.get().map(|handle| handle.render())
}

/// Record a finished execution
pub fn record_execution(mode: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!("pysandbox_executions_total", "mode" => mode, "outcome" => outcome).increment(1);
    histogram!("pysandbox_execution_duration_seconds", "mode" => mode).record(duration_secs);
}

pub fn record_pool_hit() {
    counter!("pysandbox_pool_hits_total").increment(1);
}

pub fn record_pool_miss() {
    counter!("pysandbox_pool_misses_total").increment(1);
}

pub fn record_pool_eviction(count: usize) {
    counter!("pysandbox_pool_evictions_total").increment(count as u64);
}

pub fn record_pool_size(idle: usize) {
    gauge!("pysandbox_pool_idle").set(idle as f64);
}

pub fn record_creation_failure(role: &'static str) {
    counter!("pysandbox_creation_failures_total", "role" => role).increment(1);
}

pub fn record_policy_violation() {
    counter!("pysandbox_policy_violations_total").increment(1);
}

/// Session container created
pub fn record_session_created() {
    counter!("pysandbox_sessions_created_total").increment(1);
}

/// Session cleaned up
pub fn record_session_terminated() {
    counter!("pysandbox_sessions_terminated_total").increment(1);
}

pub fn record_active_sessions(count: usize) {
    gauge!("pysandbox_active_sessions").set(count as f64);
}

pub fn record_fail_open() {
    counter!("pysandbox_wait_fail_open_total").increment(1);
}

pub fn record_install(installer: &'static str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("pysandbox_installs_total", "installer" => installer, "outcome" => outcome).increment(1);
}
