//! Periodic quota turbo service
//!
//! Bridges the pods scheduled on the node and the [`Client`]: every tick it
//! reconciles the tracked cgroups with the pods that opted in, then runs one
//! adjustment. Before starting and after stopping it hands every pod its
//! static quota back.

use crate::cgroup::DEFAULT_CGROUP_ROOT;
use crate::client::{Client, TickReport};
use crate::config::{
    validate_water_mark, TurboOption, DEFAULT_ALARM_WATER_MARK, DEFAULT_HIGH_WATER_MARK,
};
use crate::error::{Result, TurboError};
use crate::health::{components, HealthRegistry};
use crate::models::{PodSpec, RecoveryReport};
use crate::observability::{StructuredLogger, TurboMetrics};
use crate::recovery::recover_pod_quota;
use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 100;
const MIN_SYNC_INTERVAL_MS: u64 = 100;
const MAX_SYNC_INTERVAL_MS: u64 = 10_000;

/// Settings of the service loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(alias = "highWaterMark")]
    pub high_water_mark: i32,
    #[serde(alias = "alarmWaterMark")]
    pub alarm_water_mark: i32,
    /// Milliseconds between ticks
    #[serde(alias = "syncInterval")]
    pub sync_interval_ms: u64,
    pub cgroup_root: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            alarm_water_mark: DEFAULT_ALARM_WATER_MARK,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        validate_water_mark(self.high_water_mark, self.alarm_water_mark)?;
        if !(MIN_SYNC_INTERVAL_MS..=MAX_SYNC_INTERVAL_MS).contains(&self.sync_interval_ms) {
            return Err(TurboError::Validation(format!(
                "sync interval ({}ms) should range from {}ms to {}ms",
                self.sync_interval_ms, MIN_SYNC_INTERVAL_MS, MAX_SYNC_INTERVAL_MS
            )));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Lists the pods running on this node
pub trait PodSource: Send + Sync {
    fn list_pods(&self) -> Vec<PodSpec>;
}

/// A pod list that only changes when told to
#[derive(Debug, Default)]
pub struct StaticPodSource {
    pods: RwLock<Vec<PodSpec>>,
}

impl StaticPodSource {
    pub fn new(pods: Vec<PodSpec>) -> Self {
        Self {
            pods: RwLock::new(pods),
        }
    }

    pub fn set_pods(&self, pods: Vec<PodSpec>) {
        *self.pods.write() = pods;
    }
}

impl PodSource for StaticPodSource {
    fn list_pods(&self) -> Vec<PodSpec> {
        self.pods.read().clone()
    }
}

/// A container that should have its quota adjusted
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredContainer {
    pub name: String,
    pub cgroup_path: String,
    pub cpu_limit: f64,
}

/// Containers of opted-in pods, keyed by container id
///
/// Containers without a cpu limit cannot be adjusted and are left out.
pub fn desired_containers(pods: &[PodSpec]) -> HashMap<String, DesiredContainer> {
    pods.iter()
        .filter(|pod| pod.quota_turbo)
        .flat_map(|pod| {
            pod.containers
                .iter()
                .filter(|c| c.cpu_limit > 0.0)
                .map(move |c| {
                    (
                        c.id.clone(),
                        DesiredContainer {
                            name: c.name.clone(),
                            cgroup_path: pod.container_path(c),
                            cpu_limit: c.cpu_limit,
                        },
                    )
                })
        })
        .collect()
}

pub struct QuotaTurboService {
    client: Arc<Client>,
    pods: Arc<dyn PodSource>,
    config: ServiceConfig,
    health: HealthRegistry,
    metrics: TurboMetrics,
    logger: StructuredLogger,
}

impl QuotaTurboService {
    pub fn new(
        client: Arc<Client>,
        pods: Arc<dyn PodSource>,
        config: ServiceConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            pods,
            config,
            health,
            metrics: TurboMetrics::new(),
            logger,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Configure the client and restore the static quota of every pod
    pub fn pre_start(&self) -> Result<Vec<RecoveryReport>> {
        self.client.with_options([
            TurboOption::CgroupRoot(self.config.cgroup_root.clone()),
            TurboOption::WaterMark {
                high: self.config.high_water_mark,
                alarm: self.config.alarm_water_mark,
            },
        ])?;
        Ok(self.recover_all_pods())
    }

    /// Restore the static quota of every pod
    pub fn terminate(&self) -> Vec<RecoveryReport> {
        info!("Restoring static quota of every pod");
        self.recover_all_pods()
    }

    fn recover_all_pods(&self) -> Vec<RecoveryReport> {
        let root = self.client.config().cgroup_root;
        self.pods
            .list_pods()
            .iter()
            .map(|pod| self.recover_pod(&root, pod))
            .collect()
    }

    fn recover_pod(&self, root: &Path, pod: &PodSpec) -> RecoveryReport {
        let report = recover_pod_quota(self.client.accessor(), root, pod);
        if report.is_clean() {
            self.logger
                .log_pod_recovered(&pod.uid, report.containers_restored, report.unlimited);
        } else {
            warn!(
                pod_uid = %pod.uid,
                failures = report.failures.len(),
                "Pod quota only partially restored"
            );
        }
        report
    }

    /// Track exactly the desired containers
    ///
    /// Tracked cgroups are matched to containers by the last path element.
    /// Failures are logged and retried on the next sync.
    pub fn sync_cgroups(&self, desired: &HashMap<String, DesiredContainer>) {
        let mut tracked_ids = HashSet::new();
        for path in self.client.all_cgroups() {
            let id = container_id(&path).to_string();
            if !desired.contains_key(&id) {
                match self.client.remove_cgroup(&path) {
                    Ok(()) => self.logger.log_cgroup_removed(&path),
                    Err(e) => {
                        self.metrics.inc_remove_failures();
                        warn!(container_id = %id, error = %e, "Failed to remove container");
                    }
                }
            }
            tracked_ids.insert(id);
        }

        for (id, container) in desired {
            // cgroup path and limit cannot change without a container restart
            if tracked_ids.contains(id) {
                continue;
            }
            match self
                .client
                .add_cgroup(&container.cgroup_path, container.cpu_limit)
            {
                Ok(()) => self.logger.log_cgroup_added(
                    id,
                    &container.cgroup_path,
                    container.cpu_limit,
                ),
                Err(e) => {
                    self.metrics.inc_add_failures();
                    warn!(
                        container_id = %id,
                        container = %container.name,
                        error = %e,
                        "Failed to add container"
                    );
                }
            }
        }
    }

    fn adjust_blocking(&self) -> Result<TickReport> {
        let desired = desired_containers(&self.pods.list_pods());
        self.sync_cgroups(&desired);
        self.client.tick()
    }

    /// Run one sync and adjustment on a blocking thread
    pub async fn adjust_once(self: &Arc<Self>) -> anyhow::Result<TickReport> {
        let start = Instant::now();
        let this = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || this.adjust_blocking())
            .await
            .context("quota tick panicked")?;
        self.metrics
            .observe_tick_latency(start.elapsed().as_secs_f64());

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.health
                    .set_unhealthy(components::CGROUP_FS, e.to_string())
                    .await;
                return Err(e).context("failed to sample node cpu utilization");
            }
        };
        self.health.set_healthy(components::CGROUP_FS).await;

        self.metrics.set_cgroups_tracked(report.tracked);
        self.metrics.set_node_cpu_utilization(report.util);
        self.metrics.inc_quota_writes(report.quotas_written);

        if report.errors.is_empty() {
            self.health.set_healthy(components::TURBO_LOOP).await;
        } else {
            self.metrics.inc_tick_errors(report.errors.len());
            self.logger
                .log_tick_failed(&report.errors.keys(), &report.errors.to_string());
            self.health
                .set_degraded(
                    components::TURBO_LOOP,
                    format!("{} container(s) failed", report.errors.len()),
                )
                .await;
        }
        Ok(report)
    }

    /// Tick every sync interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.sync_interval_ms,
            "Starting quota turbo loop"
        );

        let mut ticker = interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.adjust_once().await {
                        warn!(error = %e, "Quota tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down quota turbo loop");
                    break;
                }
            }
        }
        debug!("Quota turbo loop stopped");
    }
}

fn container_id(cgroup_path: &str) -> &str {
    let trimmed = cgroup_path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
