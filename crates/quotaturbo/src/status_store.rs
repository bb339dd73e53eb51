//! Node and container state shared between ticks
//!
//! The store owns the set of tracked containers and the node utilization
//! history. The tracked set is guarded by a reader/writer lock and every
//! entry has its own mutex, so `add_cgroup`/`remove_cgroup` may run from
//! other threads while a tick works on a snapshot of the entries.

use crate::cgroup::{CgroupAccessor, Hierarchy};
use crate::config::Config;
use crate::cpuquota::CpuQuota;
use crate::error::{MultiError, Result, TurboError};
use crate::procstat::{calc_util, ProcStat, ProcStatSource};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// How long node utilization samples are retained
pub const UTIL_HISTORY_NS: i64 = 60 * 1_000_000_000;

/// Node CPU utilization at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuUtil {
    /// Sample time in nanoseconds
    pub timestamp: i64,
    /// Utilization percentage in [0, 100]
    pub util: f64,
}

/// Read-only view of the node handed to the policy
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub config: Config,
    /// Utilization history, oldest first
    pub cpu_utils: Vec<CpuUtil>,
    pub total_cores: f64,
}

impl NodeStatus {
    /// Latest utilization, 0 when nothing was sampled yet
    pub fn last_cpu_util(&self) -> f64 {
        self.cpu_utils.last().map(|u| u.util).unwrap_or(0.0)
    }
}

pub(crate) type SharedQuota = Arc<Mutex<CpuQuota>>;

#[derive(Default)]
struct StoreState {
    cpu_quotas: HashMap<String, SharedQuota>,
    cpu_utils: VecDeque<CpuUtil>,
    last_proc_stat: Option<ProcStat>,
}

pub struct StatusStore {
    config: RwLock<Config>,
    accessor: Arc<dyn CgroupAccessor>,
    proc_stat: Arc<dyn ProcStatSource>,
    total_cores: usize,
    state: RwLock<StoreState>,
}

impl StatusStore {
    pub fn new(
        config: Config,
        accessor: Arc<dyn CgroupAccessor>,
        proc_stat: Arc<dyn ProcStatSource>,
        total_cores: usize,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            accessor,
            proc_stat,
            total_cores,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub(crate) fn set_config(&self, config: Config) {
        *self.config.write() = config;
    }

    pub fn accessor(&self) -> &dyn CgroupAccessor {
        self.accessor.as_ref()
    }

    pub fn total_cores(&self) -> usize {
        self.total_cores
    }

    /// Start tracking a container cgroup
    ///
    /// Fails for an empty path, an unset cgroup root, a cgroup missing under
    /// the cpu controller, a limit outside (0, total cores) or when the
    /// initial read of the cgroup fails.
    pub fn add_cgroup(&self, path: &str, cpu_limit: f64, now_ns: i64) -> Result<()> {
        if path.is_empty() {
            return Err(TurboError::EmptyPath);
        }
        let cgroup_root = self.config.read().cgroup_root.clone();
        if cgroup_root.as_os_str().is_empty() {
            return Err(TurboError::UndefinedCgroupRoot);
        }

        let hierarchy = Hierarchy::new(cgroup_root, path);
        if !self.accessor.exists(&hierarchy, "cpu") {
            return Err(TurboError::CgroupNotFound(path.to_string()));
        }
        // also rejects NaN
        if !(cpu_limit > 0.0 && cpu_limit < self.total_cores as f64) {
            return Err(TurboError::InvalidCpuLimit {
                limit: cpu_limit,
                total_cores: self.total_cores,
            });
        }

        let quota = CpuQuota::new(hierarchy, cpu_limit, self.accessor.as_ref(), now_ns)?;
        let replaced = self
            .state
            .write()
            .cpu_quotas
            .insert(path.to_string(), Arc::new(Mutex::new(quota)));
        if let Some(old) = replaced {
            old.lock().retired = true;
        }

        info!(cgroup = %path, cpu_limit, "Tracking cgroup");
        Ok(())
    }

    /// Stop tracking a container cgroup
    ///
    /// Unknown paths succeed. A cgroup that still exists gets its static
    /// quota back first; if that fails the entry stays tracked.
    pub fn remove_cgroup(&self, path: &str) -> Result<()> {
        let entry = match self.state.read().cpu_quotas.get(path) {
            Some(entry) => Arc::clone(entry),
            None => return Ok(()),
        };

        {
            let mut quota = entry.lock();
            if quota.retired {
                return Ok(());
            }
            if self.accessor.exists(quota.hierarchy(), "cpu") {
                quota.recover_quota(self.accessor.as_ref())?;
            } else {
                debug!(cgroup = %path, "Cgroup vanished, forgetting it");
            }
            quota.retired = true;
        }

        let mut state = self.state.write();
        if state
            .cpu_quotas
            .get(path)
            .map_or(false, |current| Arc::ptr_eq(current, &entry))
        {
            state.cpu_quotas.remove(path);
        }
        info!(cgroup = %path, "Stopped tracking cgroup");
        Ok(())
    }

    /// Paths of every tracked cgroup, sorted
    pub fn all_cgroups(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state.read().cpu_quotas.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.state.read().cpu_quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest node utilization, 0 before the first sample
    pub fn last_cpu_util(&self) -> f64 {
        self.state
            .read()
            .cpu_utils
            .back()
            .map(|u| u.util)
            .unwrap_or(0.0)
    }

    pub fn cpu_utils(&self) -> Vec<CpuUtil> {
        self.state.read().cpu_utils.iter().copied().collect()
    }

    /// Sample /proc/stat and append the utilization since the last sample
    ///
    /// The first sample has no baseline and reads as 0. Samples older than a
    /// minute are dropped, always keeping the newest.
    pub fn update_cpu_utils(&self, now_ns: i64) -> Result<f64> {
        let stat = self.proc_stat.sample()?;

        let mut state = self.state.write();
        let util = state
            .last_proc_stat
            .map(|prev| calc_util(&prev, &stat))
            .unwrap_or(0.0);
        state.last_proc_stat = Some(stat);
        state.cpu_utils.push_back(CpuUtil {
            timestamp: now_ns,
            util,
        });
        while state.cpu_utils.len() > 1 {
            match state.cpu_utils.front() {
                Some(oldest) if now_ns - oldest.timestamp > UTIL_HISTORY_NS => {
                    state.cpu_utils.pop_front();
                }
                _ => break,
            }
        }
        Ok(util)
    }

    /// The policy's view of the node
    pub fn node_status(&self) -> NodeStatus {
        NodeStatus {
            config: self.config(),
            cpu_utils: self.cpu_utils(),
            total_cores: self.total_cores as f64,
        }
    }

    /// Handles of every tracked entry, sorted by path
    pub(crate) fn snapshot(&self) -> Vec<SharedQuota> {
        let state = self.state.read();
        let mut entries: Vec<(&String, &SharedQuota)> = state.cpu_quotas.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, q)| Arc::clone(q)).collect()
    }

    /// Refresh every entry, collecting failures by cgroup path
    ///
    /// Returns whether each entry refreshed cleanly.
    pub(crate) fn update_cpu_quotas(
        &self,
        quotas: &mut [&mut CpuQuota],
        now_ns: i64,
        errors: &mut MultiError,
    ) -> Vec<bool> {
        quotas
            .iter_mut()
            .map(|quota| match quota.refresh(self.accessor.as_ref(), now_ns) {
                Ok(()) => true,
                Err(e) => {
                    errors.push(quota.path().to_string(), e);
                    false
                }
            })
            .collect()
    }

    /// Persist every entry, collecting failures by cgroup path
    ///
    /// Returns how many quotas changed on disk.
    pub(crate) fn write_quota<'a>(
        &self,
        quotas: impl Iterator<Item = &'a mut CpuQuota>,
        errors: &mut MultiError,
    ) -> usize {
        let mut written = 0;
        for quota in quotas {
            let changed = quota.needs_write();
            match quota.persist_quota(self.accessor.as_ref()) {
                Ok(()) if changed => written += 1,
                Ok(()) => {}
                Err(e) => errors.push(quota.path().to_string(), e),
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CPU_QUOTA_KEY;
    use crate::error::ErrorKind;
    use crate::testing::{proc_stat, MockCgroupTree, RecordingAccessor, ScriptedProcStat};

    const POD: &str = "kubepods/pod1";
    const CONTAINER: &str = "kubepods/pod1/c1";

    fn store_for(
        tree: &MockCgroupTree,
        samples: Vec<ProcStat>,
    ) -> (StatusStore, Arc<RecordingAccessor>) {
        let accessor = Arc::new(RecordingAccessor::new());
        let config = Config {
            cgroup_root: tree.root().to_path_buf(),
            ..Config::default()
        };
        let store = StatusStore::new(
            config,
            accessor.clone(),
            Arc::new(ScriptedProcStat::new(samples)),
            8,
        );
        (store, accessor)
    }

    fn tree() -> MockCgroupTree {
        let tree = MockCgroupTree::new();
        tree.add(POD, 100_000, 1_000_000, 0);
        tree.add(CONTAINER, 100_000, 200_000, 0);
        tree
    }

    #[test]
    fn test_add_cgroup_rejections() {
        let tree = tree();
        let (store, _) = store_for(&tree, vec![]);

        let err = store.add_cgroup("", 2.0, 0).unwrap_err();
        assert_eq!(err.to_string(), "cgroup path should not be empty");

        for limit in [0.0, -1.0, 8.0, 9.5, f64::NAN] {
            let err = store.add_cgroup(CONTAINER, limit, 0).unwrap_err();
            assert!(
                matches!(err, TurboError::InvalidCpuLimit { .. }),
                "limit {} gave {:?}",
                limit,
                err
            );
        }

        let err = store.add_cgroup("kubepods/pod1/missing", 2.0, 0).unwrap_err();
        assert!(matches!(err, TurboError::CgroupNotFound(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_cgroup_requires_cgroup_root() {
        let tree = tree();
        let (store, _) = store_for(&tree, vec![]);
        store.set_config(Config {
            cgroup_root: Default::default(),
            ..Config::default()
        });

        let err = store.add_cgroup(CONTAINER, 2.0, 0).unwrap_err();
        assert!(matches!(err, TurboError::UndefinedCgroupRoot));
    }

    #[test]
    fn test_add_cgroup_fails_when_initial_read_fails() {
        let tree = tree();
        tree.remove_file(CONTAINER, CPU_QUOTA_KEY);
        let (store, _) = store_for(&tree, vec![]);

        let err = store.add_cgroup(CONTAINER, 2.0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_and_list_cgroups() {
        let tree = tree();
        tree.add("kubepods/pod1/a0", 100_000, 100_000, 0);
        let (store, _) = store_for(&tree, vec![]);

        store.add_cgroup(CONTAINER, 2.0, 0).unwrap();
        store.add_cgroup("kubepods/pod1/a0", 1.0, 0).unwrap();
        assert_eq!(store.all_cgroups(), vec!["kubepods/pod1/a0", CONTAINER]);
    }

    #[test]
    fn test_remove_unknown_cgroup_is_ok() {
        let tree = tree();
        let (store, accessor) = store_for(&tree, vec![]);
        store.remove_cgroup("kubepods/pod1/nope").unwrap();
        assert!(accessor.writes().is_empty());
    }

    #[test]
    fn test_remove_vanished_cgroup_writes_nothing() {
        let tree = tree();
        let (store, accessor) = store_for(&tree, vec![]);
        store.add_cgroup(CONTAINER, 1.0, 0).unwrap();

        tree.remove(CONTAINER);
        store.remove_cgroup(CONTAINER).unwrap();

        assert!(store.is_empty());
        assert!(accessor.writes().is_empty());
    }

    #[test]
    fn test_remove_restores_static_quota() {
        let tree = tree();
        tree.set_quota(CONTAINER, 300_000);
        let (store, _) = store_for(&tree, vec![]);
        store.add_cgroup(CONTAINER, 2.0, 0).unwrap();

        store.remove_cgroup(CONTAINER).unwrap();
        assert!(store.is_empty());
        assert_eq!(tree.quota(CONTAINER), 200_000);
        assert_eq!(tree.quota(POD), 900_000);
    }

    #[test]
    fn test_remove_keeps_entry_when_recovery_fails() {
        let tree = tree();
        tree.set_quota(CONTAINER, 300_000);
        let (store, accessor) = store_for(&tree, vec![]);
        store.add_cgroup(CONTAINER, 2.0, 0).unwrap();
        accessor.fail_writes_to(CONTAINER);

        assert!(store.remove_cgroup(CONTAINER).is_err());
        assert_eq!(store.all_cgroups(), vec![CONTAINER]);
    }

    #[test]
    fn test_first_util_sample_is_zero() {
        let tree = tree();
        let (store, _) = store_for(&tree, vec![proc_stat(100, 100), proc_stat(150, 150)]);

        assert_eq!(store.last_cpu_util(), 0.0);
        assert_eq!(store.update_cpu_utils(0).unwrap(), 0.0);
        assert_eq!(store.update_cpu_utils(1).unwrap(), 50.0);
        assert_eq!(store.last_cpu_util(), 50.0);
        assert_eq!(store.cpu_utils().len(), 2);
    }

    #[test]
    fn test_util_history_is_pruned_to_a_minute() {
        let tree = tree();
        let (store, _) = store_for(&tree, vec![proc_stat(0, 0)]);
        let second = 1_000_000_000;

        for t in 0..=30 {
            store.update_cpu_utils(t * second).unwrap();
        }
        store.update_cpu_utils(95 * second).unwrap();
        let utils = store.cpu_utils();
        assert_eq!(utils.len(), 1);
        assert_eq!(utils[0].timestamp, 95 * second);

        store.update_cpu_utils(120 * second).unwrap();
        store.update_cpu_utils(156 * second).unwrap();
        let timestamps: Vec<i64> = store.cpu_utils().iter().map(|u| u.timestamp).collect();
        assert_eq!(timestamps, vec![120 * second, 156 * second]);
    }

    #[test]
    fn test_util_sample_failure_propagates() {
        let tree = tree();
        let (store, _) = store_for(&tree, vec![]);
        assert!(store.update_cpu_utils(0).is_err());
        assert!(store.cpu_utils().is_empty());
    }

    #[test]
    fn test_snapshot_skips_nothing_and_is_sorted() {
        let tree = tree();
        tree.add("kubepods/pod1/a0", 100_000, 100_000, 0);
        let (store, _) = store_for(&tree, vec![]);
        store.add_cgroup(CONTAINER, 2.0, 0).unwrap();
        store.add_cgroup("kubepods/pod1/a0", 1.0, 0).unwrap();

        let paths: Vec<String> = store
            .snapshot()
            .iter()
            .map(|q| q.lock().path().to_string())
            .collect();
        assert_eq!(paths, vec!["kubepods/pod1/a0", CONTAINER]);
    }
}
