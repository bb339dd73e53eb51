//! Public entry point of the quota controller
//!
//! A [`Client`] owns one [`StatusStore`] and one [`Driver`]. Nothing is
//! global, so several controllers (for example one per NUMA node) can run in
//! the same process.

use crate::cgroup::{CgroupAccessor, FsCgroupAccessor};
use crate::config::{Config, TurboOption};
use crate::cpuquota::CpuQuota;
use crate::driver::{Driver, EventDriver};
use crate::error::{MultiError, Result};
use crate::procstat::{ProcFsStat, ProcStatSource};
use crate::status_store::{CpuUtil, StatusStore};
use chrono::Utc;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::debug;

/// Outcome of one adjustment tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Node utilization sampled by this tick
    pub util: f64,
    /// Containers the tick worked on
    pub tracked: usize,
    /// Containers whose quota changed on disk
    pub quotas_written: usize,
    /// Per-container failures keyed by cgroup path
    pub errors: MultiError,
}

impl TickReport {
    pub fn into_result(self) -> Result<()> {
        self.errors.into_result()
    }
}

pub struct Client {
    store: StatusStore,
    driver: Box<dyn Driver>,
}

impl Client {
    /// Client with the default configuration, the host filesystem and the
    /// event based policy
    pub fn new() -> Self {
        Self {
            store: StatusStore::new(
                Config::default(),
                Arc::new(FsCgroupAccessor),
                Arc::new(ProcFsStat::default()),
                num_cpus::get(),
            ),
            driver: Box::new(EventDriver),
        }
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn config(&self) -> Config {
        self.store.config()
    }

    /// Apply options in order
    ///
    /// Either every option is applied or, when one is invalid, none is.
    pub fn with_options(&self, options: impl IntoIterator<Item = TurboOption>) -> Result<()> {
        let mut config = self.store.config();
        for option in options {
            config.apply(option)?;
        }
        self.store.set_config(config);
        Ok(())
    }

    pub fn add_cgroup(&self, path: &str, cpu_limit: f64) -> Result<()> {
        self.store.add_cgroup(path, cpu_limit, now_ns())
    }

    pub fn remove_cgroup(&self, path: &str) -> Result<()> {
        self.store.remove_cgroup(path)
    }

    pub fn all_cgroups(&self) -> Vec<String> {
        self.store.all_cgroups()
    }

    pub fn last_cpu_util(&self) -> f64 {
        self.store.last_cpu_util()
    }

    pub fn cpu_utils(&self) -> Vec<CpuUtil> {
        self.store.cpu_utils()
    }

    pub fn accessor(&self) -> &dyn CgroupAccessor {
        self.store.accessor()
    }

    /// Run one tick, failing with every per-container error of the tick
    pub fn adjust_quota(&self) -> Result<()> {
        self.tick()?.into_result()
    }

    /// Run one tick and report what happened
    ///
    /// Only a failed node utilization sample aborts the tick. Containers that
    /// cannot be refreshed still count toward the policy with their last
    /// known state but are not written this tick.
    pub fn tick(&self) -> Result<TickReport> {
        self.tick_at(now_ns())
    }

    pub(crate) fn tick_at(&self, now_ns: i64) -> Result<TickReport> {
        let util = self.store.update_cpu_utils(now_ns)?;
        let mut report = TickReport {
            util,
            ..TickReport::default()
        };

        let entries = self.store.snapshot();
        if entries.is_empty() {
            return Ok(report);
        }

        let mut guards: Vec<MutexGuard<'_, CpuQuota>> =
            entries.iter().map(|entry| entry.lock()).collect();
        guards.retain(|quota| !quota.retired);
        let mut quotas: Vec<&mut CpuQuota> = guards.iter_mut().map(|g| &mut **g).collect();
        report.tracked = quotas.len();

        let refreshed = self
            .store
            .update_cpu_quotas(&mut quotas, now_ns, &mut report.errors);

        let node = self.store.node_status();
        self.driver.adjust_quota(&node, &mut quotas);

        let writable = quotas
            .into_iter()
            .zip(refreshed)
            .filter_map(|(quota, ok)| ok.then_some(quota));
        report.quotas_written = self.store.write_quota(writable, &mut report.errors);

        debug!(
            util,
            tracked = report.tracked,
            written = report.quotas_written,
            failed = report.errors.len(),
            "Quota tick finished"
        );
        Ok(report)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a [`Client`] with custom collaborators
#[derive(Default)]
pub struct ClientBuilder {
    config: Config,
    accessor: Option<Arc<dyn CgroupAccessor>>,
    proc_stat: Option<Arc<dyn ProcStatSource>>,
    driver: Option<Box<dyn Driver>>,
    total_cores: Option<usize>,
}

impl ClientBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn accessor(mut self, accessor: Arc<dyn CgroupAccessor>) -> Self {
        self.accessor = Some(accessor);
        self
    }

    pub fn proc_stat(mut self, proc_stat: Arc<dyn ProcStatSource>) -> Self {
        self.proc_stat = Some(proc_stat);
        self
    }

    pub fn driver(mut self, driver: Box<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Number of cores the node exposes, detected when unset
    pub fn total_cores(mut self, total_cores: usize) -> Self {
        self.total_cores = Some(total_cores);
        self
    }

    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let store = StatusStore::new(
            self.config,
            self.accessor.unwrap_or_else(|| Arc::new(FsCgroupAccessor)),
            self.proc_stat
                .unwrap_or_else(|| Arc::new(ProcFsStat::default())),
            self.total_cores.unwrap_or_else(num_cpus::get),
        );
        Ok(Client {
            store,
            driver: self.driver.unwrap_or_else(|| Box::new(EventDriver)),
        })
    }
}

pub(crate) fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CPU_STAT_KEY;
    use crate::error::{ErrorKind, TurboError};
    use crate::procstat::ProcStat;
    use crate::testing::{proc_stat, MockCgroupTree, RecordingAccessor, ScriptedProcStat};

    const SECOND: i64 = 1_000_000_000;
    const POD: &str = "kubepods/pod1";
    const C1: &str = "kubepods/pod1/c1";
    const C2: &str = "kubepods/pod1/c2";

    fn client(tree: &MockCgroupTree, samples: Vec<ProcStat>) -> (Client, Arc<RecordingAccessor>) {
        let accessor = Arc::new(RecordingAccessor::new());
        let client = Client::builder()
            .config(Config {
                cgroup_root: tree.root().to_path_buf(),
                ..Config::default()
            })
            .accessor(accessor.clone())
            .proc_stat(Arc::new(ScriptedProcStat::new(samples)))
            .total_cores(8)
            .build()
            .unwrap();
        (client, accessor)
    }

    fn quiet_samples() -> Vec<ProcStat> {
        vec![proc_stat(0, 0), proc_stat(10, 990)]
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = Client::builder()
            .config(Config {
                high_water_mark: 90,
                alarm_water_mark: 80,
                ..Config::default()
            })
            .build();
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Validation));
    }

    #[test]
    fn test_with_options_is_all_or_nothing() {
        let tree = MockCgroupTree::new();
        let (client, _) = client(&tree, vec![]);

        client
            .with_options([
                TurboOption::WaterMark { high: 50, alarm: 70 },
                TurboOption::ElevateLimit(2.0),
            ])
            .unwrap();
        assert_eq!(client.config().high_water_mark, 50);
        assert_eq!(client.config().elevate_limit, 2.0);

        let err = client
            .with_options([
                TurboOption::CpuFloatingLimit(20.0),
                TurboOption::WaterMark { high: 80, alarm: 70 },
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(client.config().cpu_floating_limit, 10.0);
        assert_eq!(client.config().alarm_water_mark, 70);
    }

    #[test]
    fn test_tick_without_cgroups_samples_utilization() {
        let tree = MockCgroupTree::new();
        let (client, accessor) = client(&tree, vec![proc_stat(0, 0), proc_stat(30, 70)]);

        client.adjust_quota().unwrap();
        assert_eq!(client.last_cpu_util(), 0.0);
        client.adjust_quota().unwrap();
        assert_eq!(client.last_cpu_util(), 30.0);
        assert!(accessor.writes().is_empty());
    }

    #[test]
    fn test_tick_fails_when_utilization_cannot_be_sampled() {
        let tree = MockCgroupTree::new();
        let (client, _) = client(&tree, vec![]);
        assert!(client.adjust_quota().is_err());
    }

    #[test]
    fn test_add_cgroup_rejections() {
        let tree = MockCgroupTree::new();
        tree.add(C1, 100_000, 200_000, 0);
        let (client, _) = client(&tree, vec![]);

        let err = client.add_cgroup("", 2.0).unwrap_err();
        assert!(err.to_string().contains("path should not be empty"));
        let err = client.add_cgroup(C1, 0.0).unwrap_err();
        assert!(matches!(err, TurboError::InvalidCpuLimit { .. }));
        assert!(client.all_cgroups().is_empty());

        client.add_cgroup(C1, 2.0).unwrap();
        assert_eq!(client.all_cgroups(), vec![C1]);
    }

    #[test]
    fn test_alarm_reclaims_down_to_static_quota() {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 1_000_000, 0);
        tree.add(C1, 100_000, 400_000, 0);
        let (client, _) = client(&tree, vec![proc_stat(0, 0), proc_stat(90, 10)]);
        client.store.add_cgroup(C1, 2.0, 0).unwrap();

        // first tick has no utilization baseline
        let report = client.tick_at(SECOND).unwrap();
        assert_eq!(report.util, 0.0);
        let after_first = tree.quota(C1);
        assert!((200_000..=400_000).contains(&after_first));

        let report = client.tick_at(2 * SECOND).unwrap();
        assert_eq!(report.util, 90.0);
        assert!(report.errors.is_empty());
        assert_eq!(tree.quota(C1), 200_000);
        assert_eq!(tree.quota(POD), 800_000);
    }

    #[test]
    fn test_throttled_container_is_elevated_with_its_parent() {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 500_000, 0);
        tree.add(C1, 100_000, 100_000, 0);
        let (client, accessor) = client(&tree, quiet_samples());
        client.store.add_cgroup(C1, 1.0, 0).unwrap();

        tree.set_throttle(C1, 5, 50_000_000);
        let report = client.tick_at(SECOND).unwrap();
        assert_eq!(report.quotas_written, 1);

        let raised = tree.quota(C1) - 100_000;
        assert!(raised > 0 && raised <= 8_000, "raised by {}", raised);
        assert_eq!(tree.quota(POD), 500_000 + raised);
        assert_eq!(accessor.written_paths(), vec![POD, C1]);
    }

    #[test]
    fn test_tick_aggregates_errors_and_keeps_going() {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 1_000_000, 0);
        tree.add(C1, 100_000, 100_000, 0);
        tree.add(C2, 100_000, 100_000, 0);
        let (client, accessor) = client(&tree, quiet_samples());
        client.store.add_cgroup(C1, 1.0, 0).unwrap();
        client.store.add_cgroup(C2, 1.0, 0).unwrap();

        tree.set_throttle(C1, 5, 50_000_000);
        tree.set_throttle(C2, 5, 50_000_000);
        tree.remove_file(C1, CPU_STAT_KEY);

        let report = client.tick_at(SECOND).unwrap();
        assert_eq!(report.tracked, 2);
        assert_eq!(report.errors.keys(), vec![C1]);
        // the healthy container still got its quota
        assert_eq!(report.quotas_written, 1);
        assert!(!accessor.written_paths().contains(&C1.to_string()));
        assert!(tree.quota(C2) > 100_000);

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains(C1));
    }

    #[test]
    fn test_vanished_cgroup_degrades_only_itself() {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 1_000_000, 0);
        tree.add(C1, 100_000, 100_000, 0);
        tree.add(C2, 100_000, 100_000, 0);
        let (client, _) = client(&tree, quiet_samples());
        client.store.add_cgroup(C1, 1.0, 0).unwrap();
        client.store.add_cgroup(C2, 1.0, 0).unwrap();

        tree.remove(C2);
        let report = client.tick_at(SECOND).unwrap();
        assert_eq!(report.errors.keys(), vec![C2]);

        client.remove_cgroup(C2).unwrap();
        assert_eq!(client.all_cgroups(), vec![C1]);
    }

    #[test]
    fn test_removed_cgroup_is_not_touched_by_later_ticks() {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 1_000_000, 0);
        tree.add(C1, 100_000, 100_000, 0);
        let (client, accessor) = client(&tree, quiet_samples());
        client.store.add_cgroup(C1, 1.0, 0).unwrap();

        client.remove_cgroup(C1).unwrap();
        tree.set_throttle(C1, 5, 50_000_000);
        let report = client.tick_at(SECOND).unwrap();
        assert_eq!(report.tracked, 0);
        assert!(accessor.writes().is_empty());
    }

    #[test]
    fn test_unlimited_container_never_grows_its_pod() {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 1_000_000, 0);
        tree.add(C1, 100_000, -1, 0);
        let (client, accessor) = client(&tree, quiet_samples());
        client.store.add_cgroup(C1, 2.0, 0).unwrap();

        for n in 1..=3 {
            let report = client.tick_at(n * SECOND).unwrap();
            assert!(report.errors.is_empty());
            assert_eq!(report.quotas_written, 0);
        }
        assert_eq!(tree.quota(POD), 1_000_000);
        assert_eq!(tree.quota(C1), -1);
        assert!(accessor.writes().is_empty());
    }

    #[test]
    fn test_remove_races_with_ticks() {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 1_000_000, 0);
        tree.add(C1, 100_000, 100_000, 0);
        tree.add(C2, 100_000, 100_000, 0);
        tree.set_throttle(C1, 5, 50_000_000);
        let (client, accessor) = client(&tree, quiet_samples());
        client.store.add_cgroup(C1, 1.0, 0).unwrap();
        client.store.add_cgroup(C2, 1.0, 0).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for n in 1..=50 {
                    client.tick_at(n * SECOND).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..50 {
                    client.remove_cgroup(C1).unwrap();
                    std::thread::yield_now();
                }
            });
        });

        assert_eq!(client.all_cgroups(), vec![C2]);
        assert_eq!(tree.quota(C1), 100_000);

        let c1_writes = |writes: Vec<(String, String)>| {
            writes.into_iter().filter(|(path, _)| path == C1).count()
        };
        let before = c1_writes(accessor.writes());
        tree.set_throttle(C1, 10, 100_000_000);
        for n in 51..=55 {
            client.tick_at(n * SECOND).unwrap();
        }
        assert_eq!(c1_writes(accessor.writes()), before);
        assert_eq!(tree.quota(C1), 100_000);
    }
}
