//! Test helpers: mock cgroup v1 trees, a write-recording accessor and a
//! scripted /proc/stat source.

use crate::cgroup::{
    CgroupAccessor, CgroupKey, FsCgroupAccessor, Hierarchy, CPUACCT_USAGE_KEY, CPU_PERIOD_KEY,
    CPU_QUOTA_KEY, CPU_STAT_KEY,
};
use crate::error::{Result, TurboError};
use crate::procstat::{ProcStat, ProcStatSource};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use tempfile::TempDir;

/// A cgroup v1 tree (cpu + cpuacct controllers) inside a temp directory
pub(crate) struct MockCgroupTree {
    dir: TempDir,
}

impl MockCgroupTree {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn hierarchy(&self, path: &str) -> Hierarchy {
        Hierarchy::new(self.root(), path)
    }

    /// Create a cgroup with period, quota, an empty cpu.stat and usage
    pub fn add(&self, path: &str, period: i64, quota: i64, usage_ns: i64) {
        let h = self.hierarchy(path);
        fs::create_dir_all(h.controller_dir("cpu")).unwrap();
        fs::create_dir_all(h.controller_dir("cpuacct")).unwrap();
        fs::write(h.attr_path(CPU_PERIOD_KEY), format!("{}\n", period)).unwrap();
        fs::write(h.attr_path(CPU_QUOTA_KEY), format!("{}\n", quota)).unwrap();
        self.set_throttle(path, 0, 0);
        self.set_usage(path, usage_ns);
    }

    pub fn set_throttle(&self, path: &str, nr_throttled: i64, throttled_time_ns: i64) {
        let content = format!(
            "nr_periods {}\nnr_throttled {}\nthrottled_time {}\n",
            nr_throttled * 2,
            nr_throttled,
            throttled_time_ns
        );
        fs::write(self.hierarchy(path).attr_path(CPU_STAT_KEY), content).unwrap();
    }

    pub fn set_usage(&self, path: &str, usage_ns: i64) {
        fs::write(
            self.hierarchy(path).attr_path(CPUACCT_USAGE_KEY),
            format!("{}\n", usage_ns),
        )
        .unwrap();
    }

    pub fn set_quota(&self, path: &str, quota: i64) {
        fs::write(
            self.hierarchy(path).attr_path(CPU_QUOTA_KEY),
            format!("{}\n", quota),
        )
        .unwrap();
    }

    pub fn quota(&self, path: &str) -> i64 {
        self.read(path, CPU_QUOTA_KEY).parse().unwrap()
    }

    pub fn read(&self, path: &str, key: CgroupKey) -> String {
        fs::read_to_string(self.hierarchy(path).attr_path(key))
            .unwrap()
            .trim()
            .to_string()
    }

    pub fn remove_file(&self, path: &str, key: CgroupKey) {
        fs::remove_file(self.hierarchy(path).attr_path(key)).unwrap();
    }

    /// Remove the cgroup from every controller, as a pod teardown would
    pub fn remove(&self, path: &str) {
        let h = self.hierarchy(path);
        fs::remove_dir_all(h.controller_dir("cpu")).unwrap();
        fs::remove_dir_all(h.controller_dir("cpuacct")).unwrap();
    }
}

/// Filesystem accessor that records every quota write in order and can be
/// told to fail writes to specific cgroups
#[derive(Default)]
pub(crate) struct RecordingAccessor {
    inner: FsCgroupAccessor,
    writes: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    /// Successful writes as (cgroup path, value)
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().clone()
    }

    pub fn written_paths(&self) -> Vec<String> {
        self.writes().into_iter().map(|(path, _)| path).collect()
    }
}

impl CgroupAccessor for RecordingAccessor {
    fn get(&self, hierarchy: &Hierarchy, key: CgroupKey) -> Result<String> {
        self.inner.get(hierarchy, key)
    }

    fn set(&self, hierarchy: &Hierarchy, key: CgroupKey, value: &str) -> Result<()> {
        if self.failing.lock().contains(&hierarchy.path) {
            return Err(TurboError::Write {
                path: hierarchy.path.clone(),
                file: key.file.to_string(),
                value: value.to_string(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        self.inner.set(hierarchy, key, value)?;
        self.writes
            .lock()
            .push((hierarchy.path.clone(), value.to_string()));
        Ok(())
    }

    fn exists(&self, hierarchy: &Hierarchy, subsystem: &str) -> bool {
        self.inner.exists(hierarchy, subsystem)
    }
}

/// Build a /proc/stat sample with the given busy and idle jiffies
pub(crate) fn proc_stat(busy: u64, idle: u64) -> ProcStat {
    ProcStat::parse(&format!("cpu  {} 0 0 {} 0 0 0 0 0 0\n", busy, idle)).unwrap()
}

/// Returns queued samples in order, then repeats the last one
pub(crate) struct ScriptedProcStat {
    samples: Mutex<VecDeque<ProcStat>>,
    last: Mutex<Option<ProcStat>>,
}

impl ScriptedProcStat {
    pub fn new(samples: Vec<ProcStat>) -> Self {
        Self {
            samples: Mutex::new(samples.into()),
            last: Mutex::new(None),
        }
    }
}

impl ProcStatSource for ScriptedProcStat {
    fn sample(&self) -> Result<ProcStat> {
        let next = self.samples.lock().pop_front();
        let mut last = self.last.lock();
        match next.or(*last) {
            Some(stat) => {
                *last = Some(stat);
                Ok(stat)
            }
            None => Err(TurboError::parse("/proc/stat", "no samples scripted")),
        }
    }
}
