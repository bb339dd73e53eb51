//! cgroup v1 attribute access
//!
//! The controller never touches the filesystem directly. It reads and writes
//! named attribute files through a [`CgroupAccessor`], which makes every
//! decision testable against a mock hierarchy:
//! - cpu controller for `cpu.cfs_period_us`, `cpu.cfs_quota_us`, `cpu.stat`
//! - cpuacct controller for `cpuacct.usage`

mod fs;

pub use fs::FsCgroupAccessor;

use crate::error::{Result, TurboError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default mount point of the cgroup v1 controllers
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Quota value meaning "no limit"
pub const UNLIMITED_QUOTA: i64 = -1;

/// A cgroup attribute file under one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CgroupKey {
    pub subsystem: &'static str,
    pub file: &'static str,
}

pub const CPU_PERIOD_KEY: CgroupKey = CgroupKey {
    subsystem: "cpu",
    file: "cpu.cfs_period_us",
};

pub const CPU_QUOTA_KEY: CgroupKey = CgroupKey {
    subsystem: "cpu",
    file: "cpu.cfs_quota_us",
};

pub const CPU_STAT_KEY: CgroupKey = CgroupKey {
    subsystem: "cpu",
    file: "cpu.stat",
};

pub const CPUACCT_USAGE_KEY: CgroupKey = CgroupKey {
    subsystem: "cpuacct",
    file: "cpuacct.usage",
};

/// A cgroup path relative to the controller mount point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub mount_point: PathBuf,
    pub path: String,
}

impl Hierarchy {
    pub fn new(mount_point: impl Into<PathBuf>, path: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            path: path.into(),
        }
    }

    /// Directory of this cgroup under a specific controller
    pub fn controller_dir(&self, subsystem: &str) -> PathBuf {
        self.mount_point
            .join(subsystem)
            .join(self.path.trim_start_matches('/'))
    }

    /// Full path of an attribute file
    pub fn attr_path(&self, key: CgroupKey) -> PathBuf {
        self.controller_dir(key.subsystem).join(key.file)
    }
}

/// Capability to read and write cgroup attribute files
pub trait CgroupAccessor: Send + Sync {
    /// Read the raw contents of an attribute, trimmed
    fn get(&self, hierarchy: &Hierarchy, key: CgroupKey) -> Result<String>;

    /// Write a value to an attribute
    fn set(&self, hierarchy: &Hierarchy, key: CgroupKey, value: &str) -> Result<()>;

    /// Whether the cgroup directory exists under a controller
    fn exists(&self, hierarchy: &Hierarchy, subsystem: &str) -> bool;

    /// Read an attribute holding a single integer
    fn get_i64(&self, hierarchy: &Hierarchy, key: CgroupKey) -> Result<i64> {
        let content = self.get(hierarchy, key)?;
        content
            .trim()
            .parse()
            .map_err(|e| TurboError::parse(format!("{} of cgroup {}", key.file, hierarchy.path), e))
    }

    /// Read and parse `cpu.stat`
    fn get_cpu_stat(&self, hierarchy: &Hierarchy) -> Result<CpuStat> {
        let content = self.get(hierarchy, CPU_STAT_KEY)?;
        CpuStat::parse(&content)
    }
}

/// Throttling counters from `cpu.stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuStat {
    pub nr_periods: i64,
    pub nr_throttled: i64,
    /// Total throttled time in nanoseconds
    pub throttled_time: i64,
}

impl CpuStat {
    /// Parse `cpu.stat` contents
    ///
    /// Every non-empty line must be a `name value` pair with an integer value.
    /// Unknown names are ignored and missing ones read as zero.
    pub fn parse(content: &str) -> Result<Self> {
        let mut stat = CpuStat::default();

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            if parts.len() != 2 {
                return Err(TurboError::parse(
                    "cpu.stat",
                    format!("expected a name and a value, got {:?}", line),
                ));
            }
            let value: i64 = parts[1]
                .parse()
                .map_err(|e| TurboError::parse("cpu.stat", format!("{}: {}", parts[0], e)))?;

            match parts[0] {
                "nr_periods" => stat.nr_periods = value,
                "nr_throttled" => stat.nr_throttled = value,
                "throttled_time" => stat.throttled_time = value,
                _ => {}
            }
        }

        Ok(stat)
    }
}
