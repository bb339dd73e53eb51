//! Prometheus metrics and structured events of the quota controller

use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Tick latency buckets in seconds
const TICK_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

static GLOBAL_METRICS: OnceLock<TurboMetricsInner> = OnceLock::new();

struct TurboMetricsInner {
    tick_latency_seconds: Histogram,
    cgroups_tracked: IntGauge,
    node_cpu_utilization: Gauge,
    tick_errors: IntCounter,
    quota_writes: IntCounter,
    cgroup_sync_failures: IntCounterVec,
}

impl TurboMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "quotaturbo_tick_latency_seconds",
                "Time spent in one quota adjustment tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            cgroups_tracked: register_int_gauge!(
                "quotaturbo_cgroups_tracked",
                "Number of container cgroups whose quota is adjusted"
            )
            .expect("Failed to register cgroups_tracked"),

            node_cpu_utilization: register_gauge!(
                "quotaturbo_node_cpu_utilization_percent",
                "Node CPU utilization sampled by the last tick"
            )
            .expect("Failed to register node_cpu_utilization"),

            tick_errors: register_int_counter!(
                "quotaturbo_tick_errors_total",
                "Container failures reported by adjustment ticks"
            )
            .expect("Failed to register tick_errors"),

            quota_writes: register_int_counter!(
                "quotaturbo_quota_writes_total",
                "Container quotas changed on disk"
            )
            .expect("Failed to register quota_writes"),

            cgroup_sync_failures: register_int_counter_vec!(
                "quotaturbo_cgroup_sync_failures_total",
                "Failures to start or stop tracking a cgroup",
                &["operation"]
            )
            .expect("Failed to register cgroup_sync_failures"),
        }
    }
}

/// Handle to the process-wide metric set; clones share it
#[derive(Clone)]
pub struct TurboMetrics {
    _private: (),
}

impl Default for TurboMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TurboMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TurboMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TurboMetricsInner {
        GLOBAL_METRICS.get_or_init(TurboMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn set_cgroups_tracked(&self, count: usize) {
        self.inner().cgroups_tracked.set(count as i64);
    }

    pub fn set_node_cpu_utilization(&self, util: f64) {
        self.inner().node_cpu_utilization.set(util);
    }

    pub fn inc_tick_errors(&self, count: usize) {
        self.inner().tick_errors.inc_by(count as u64);
    }

    pub fn inc_quota_writes(&self, count: usize) {
        self.inner().quota_writes.inc_by(count as u64);
    }

    pub fn inc_add_failures(&self) {
        self.inner()
            .cgroup_sync_failures
            .with_label_values(&["add"])
            .inc();
    }

    pub fn inc_remove_failures(&self) {
        self.inner()
            .cgroup_sync_failures
            .with_label_values(&["remove"])
            .inc();
    }
}

/// Event-shaped log lines of the controller
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, high_water_mark: i32, alarm_water_mark: i32) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            high_water_mark,
            alarm_water_mark,
            "Quota turbo agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Quota turbo agent shutting down"
        );
    }

    pub fn log_cgroup_added(&self, container_id: &str, cgroup_path: &str, cpu_limit: f64) {
        info!(
            event = "cgroup_added",
            node = %self.node_name,
            container_id = %container_id,
            cgroup_path = %cgroup_path,
            cpu_limit,
            "Started adjusting container quota"
        );
    }

    pub fn log_cgroup_removed(&self, cgroup_path: &str) {
        info!(
            event = "cgroup_removed",
            node = %self.node_name,
            cgroup_path = %cgroup_path,
            "Stopped adjusting container quota"
        );
    }

    pub fn log_tick_failed(&self, failed_cgroups: &[&str], error: &str) {
        warn!(
            event = "tick_failed",
            node = %self.node_name,
            failed_cgroups = ?failed_cgroups,
            error = %error,
            "Quota adjustment tick reported errors"
        );
    }

    pub fn log_pod_recovered(&self, pod_uid: &str, containers: usize, unlimited: bool) {
        info!(
            event = "pod_recovered",
            node = %self.node_name,
            pod_uid = %pod_uid,
            containers,
            unlimited,
            "Restored static pod quota"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_registry() {
        let metrics = TurboMetrics::new();
        let other = metrics.clone();

        metrics.observe_tick_latency(0.002);
        metrics.set_cgroups_tracked(3);
        metrics.set_node_cpu_utilization(42.5);
        other.inc_tick_errors(2);
        other.inc_quota_writes(1);
        other.inc_add_failures();
        other.inc_remove_failures();

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"quotaturbo_cgroups_tracked".to_string()));
        assert!(names.contains(&"quotaturbo_cgroup_sync_failures_total".to_string()));
    }

    #[test]
    fn test_structured_logger() {
        let logger = StructuredLogger::new("node-a");
        assert_eq!(logger.node_name(), "node-a");
        logger.log_tick_failed(&["kubepods/p/c"], "boom");
    }
}
