//! Per-container CPU quota state
//!
//! A [`CpuQuota`] mirrors one container cgroup: its CFS period and quota,
//! throttling counters from the last two ticks and a short history of
//! cumulative CPU usage. The policy fills in `quota_delta`; the entity turns
//! it into `next_quota` bounds and writes the result through the hierarchy.

use crate::cgroup::{
    CgroupAccessor, CpuStat, Hierarchy, CPUACCT_USAGE_KEY, CPU_PERIOD_KEY, CPU_QUOTA_KEY,
    UNLIMITED_QUOTA,
};
use crate::error::{MultiError, Result, TurboError};
use crate::math::{self, ns_to_us};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, warn};

/// Number of periods over which usage is accounted against the limit
pub const NUMBER_OF_RESTRICTED_CYCLES: usize = 60;

/// Default value of `cpu.cfs_period_us` (100ms)
pub const DEFAULT_CFS_PERIOD_US: i64 = 100_000;

/// Ratio between the height limit and the static quota
pub const EASING_MULTIPLE: f64 = 2.0;

/// Ratio between the smoothing threshold and the height limit
const LIMIT_MULTIPLIER: f64 = 3.0;

const MAX_QUOTA_PRECISION: f64 = 1e-10;

/// Ancestors at which quota propagation stops
const PROPAGATION_ROOTS: &[&str] = &[".", "/", "", "kubepods", "/kubepods"];

/// Cumulative CPU time used by a container at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuUsage {
    /// Sample time in nanoseconds
    pub timestamp: i64,
    /// `cpuacct.usage` in nanoseconds
    pub usage: i64,
}

/// CPU quota bookkeeping of a single container
#[derive(Debug, Clone)]
pub struct CpuQuota {
    pub(crate) hierarchy: Hierarchy,
    /// Static limit in cores
    pub(crate) cpu_limit: f64,
    pub(crate) cur_throttle: CpuStat,
    pub(crate) pre_throttle: CpuStat,
    pub(crate) period: i64,
    pub(crate) cur_quota: i64,
    pub(crate) next_quota: i64,
    /// Adjustment decided by the policy during the current tick
    pub(crate) quota_delta: f64,
    pub(crate) height_limit: f64,
    /// Largest quota the usage history allows for the next period
    pub(crate) max_quota_next_period: f64,
    pub(crate) cpu_usages: VecDeque<CpuUsage>,
    /// Set once the entry was handed back; a running tick must not touch it
    pub(crate) retired: bool,
}

impl CpuQuota {
    /// Create the entry and read its initial state from the cgroup
    pub fn new(
        hierarchy: Hierarchy,
        cpu_limit: f64,
        accessor: &dyn CgroupAccessor,
        now_ns: i64,
    ) -> Result<Self> {
        let mut quota = Self::unrefreshed(hierarchy, cpu_limit);
        quota.refresh(accessor, now_ns)?;
        // no throttling happened "since the previous tick" yet
        quota.pre_throttle = quota.cur_throttle;
        Ok(quota)
    }

    /// Entry with default period and static quota, without reading anything
    pub fn unrefreshed(hierarchy: Hierarchy, cpu_limit: f64) -> Self {
        let static_quota = cpu_limit * DEFAULT_CFS_PERIOD_US as f64;
        Self {
            hierarchy,
            cpu_limit,
            cur_throttle: CpuStat::default(),
            pre_throttle: CpuStat::default(),
            period: DEFAULT_CFS_PERIOD_US,
            cur_quota: static_quota as i64,
            next_quota: static_quota as i64,
            quota_delta: 0.0,
            height_limit: static_quota,
            max_quota_next_period: static_quota,
            cpu_usages: VecDeque::with_capacity(NUMBER_OF_RESTRICTED_CYCLES),
            retired: false,
        }
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn path(&self) -> &str {
        &self.hierarchy.path
    }

    pub fn cpu_limit(&self) -> f64 {
        self.cpu_limit
    }

    pub fn period(&self) -> i64 {
        self.period
    }

    pub fn cur_quota(&self) -> i64 {
        self.cur_quota
    }

    pub fn next_quota(&self) -> i64 {
        self.next_quota
    }

    pub fn quota_delta(&self) -> f64 {
        self.quota_delta
    }

    pub fn height_limit(&self) -> f64 {
        self.height_limit
    }

    pub fn max_quota_next_period(&self) -> f64 {
        self.max_quota_next_period
    }

    pub fn throttle(&self) -> (CpuStat, CpuStat) {
        (self.pre_throttle, self.cur_throttle)
    }

    pub fn usage_samples(&self) -> usize {
        self.cpu_usages.len()
    }

    /// Quota matching the static cpu limit
    pub fn static_quota(&self) -> f64 {
        self.cpu_limit * self.period as f64
    }

    /// Whether throttling happened since the previous refresh
    pub fn is_throttled(&self) -> bool {
        self.cur_throttle.nr_throttled > self.pre_throttle.nr_throttled
    }

    /// Re-read period, throttling, quota and usage
    ///
    /// Every read is attempted even if an earlier one fails. Values whose
    /// read failed keep their previous state.
    pub fn refresh(&mut self, accessor: &dyn CgroupAccessor, now_ns: i64) -> Result<()> {
        let mut errors = MultiError::new();

        if let Err(e) = self.update_period(accessor) {
            errors.push(CPU_PERIOD_KEY.file, e);
        }
        if let Err(e) = self.update_throttle(accessor) {
            errors.push("cpu.stat", e);
        }
        if let Err(e) = self.update_quota(accessor) {
            errors.push(CPU_QUOTA_KEY.file, e);
        }
        if let Err(e) = self.update_usage(accessor, now_ns) {
            errors.push(CPUACCT_USAGE_KEY.file, e);
        }

        errors.into_result()
    }

    fn update_period(&mut self, accessor: &dyn CgroupAccessor) -> Result<()> {
        self.period = accessor.get_i64(&self.hierarchy, CPU_PERIOD_KEY)?;
        Ok(())
    }

    fn update_throttle(&mut self, accessor: &dyn CgroupAccessor) -> Result<()> {
        self.pre_throttle = self.cur_throttle;
        self.cur_throttle = accessor.get_cpu_stat(&self.hierarchy)?;
        Ok(())
    }

    fn update_quota(&mut self, accessor: &dyn CgroupAccessor) -> Result<()> {
        self.quota_delta = 0.0;
        self.cur_quota = accessor.get_i64(&self.hierarchy, CPU_QUOTA_KEY)?;
        Ok(())
    }

    fn update_usage(&mut self, accessor: &dyn CgroupAccessor, now_ns: i64) -> Result<()> {
        let usage = accessor.get_i64(&self.hierarchy, CPUACCT_USAGE_KEY)?;
        if self.cpu_usages.len() >= NUMBER_OF_RESTRICTED_CYCLES {
            self.cpu_usages.pop_front();
        }
        self.cpu_usages.push_back(CpuUsage {
            timestamp: now_ns,
            usage,
        });
        Ok(())
    }

    /// Largest quota the recent usage history still allows
    ///
    /// The container may use `cpu_limit` cores on average across the usage
    /// window. What it did not use yet is offered for the next period, and
    /// the offer shrinks smoothly toward the static quota as the balance
    /// drops below three height limits instead of falling off a cliff.
    pub fn compute_max_next_period_quota(&self) -> f64 {
        let (first, last) = match (self.cpu_usages.front(), self.cpu_usages.back()) {
            (Some(first), Some(last)) if self.cpu_usages.len() > 1 => (*first, *last),
            _ => return self.height_limit,
        };

        let samples = self.cpu_usages.len() as f64;
        let period = self.period as f64;
        let origin = self.static_quota();

        let time_delta = ns_to_us(last.timestamp - first.timestamp);
        let max_available = self.cpu_limit * time_delta * (samples / (samples - 1.0));
        let used = ns_to_us(last.usage - first.usage);
        let remaining_usage = max_available - used;

        let threshold = LIMIT_MULTIPLIER * self.height_limit;
        let remaining_quota =
            math::saturating_div(remaining_usage, time_delta, f64::MAX, MAX_QUOTA_PRECISION)
                * (samples - 1.0)
                * period;

        let mut result = remaining_quota;
        if remaining_quota <= threshold {
            result = origin
                + math::saturating_div(
                    (self.height_limit - origin) * remaining_quota,
                    threshold,
                    threshold,
                    MAX_QUOTA_PRECISION,
                );
        }

        result.min(self.height_limit).max(origin)
    }

    /// Whether persisting would write anything
    ///
    /// An unlimited cgroup is never made finite, so it has nothing to write.
    pub fn needs_write(&self) -> bool {
        self.cur_quota != UNLIMITED_QUOTA && self.next_quota != self.cur_quota
    }

    /// Write `next_quota` to this cgroup and its ancestors
    ///
    /// Nothing is touched when the quota does not change or the cgroup
    /// itself is unlimited.
    pub fn persist_quota(&mut self, accessor: &dyn CgroupAccessor) -> Result<()> {
        if !self.needs_write() {
            return Ok(());
        }
        let delta = self.next_quota - self.cur_quota;

        let chain = propagation_chain(&self.hierarchy.path)?;
        write_quota_chain(accessor, &self.hierarchy.mount_point, &chain, delta)?;

        debug!(
            cgroup = %self.hierarchy.path,
            from = self.cur_quota,
            to = self.next_quota,
            "Persisted cpu quota"
        );
        self.cur_quota = self.next_quota;
        Ok(())
    }

    /// Hand the static quota back to the cgroup
    pub fn recover_quota(&mut self, accessor: &dyn CgroupAccessor) -> Result<()> {
        // period is between 1ms and 1s so this cannot overflow
        self.next_quota = self.static_quota() as i64;
        self.persist_quota(accessor)
    }
}

/// The cgroup followed by its ancestors, child first, stopping below the
/// shared `kubepods` root
pub(crate) fn propagation_chain(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Err(TurboError::InvalidPath(path.to_string()));
    }

    let mut chain = Vec::new();
    let mut current = normalize(path);
    while !PROPAGATION_ROOTS.contains(&current.as_str()) {
        let parent = parent_of(&current);
        chain.push(current);
        current = parent;
    }

    if chain.is_empty() {
        return Err(TurboError::InvalidPath(path.to_string()));
    }
    Ok(chain)
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        None => ".".to_string(),
        Some(idx) => normalize(&path[..=idx]),
    }
}

/// Apply `delta` to the quota of every cgroup in `chain`
///
/// Raising writes parents first so the children always fit; lowering writes
/// children first. A failure restores everything written so far.
fn write_quota_chain(
    accessor: &dyn CgroupAccessor,
    mount_point: &Path,
    chain: &[String],
    delta: i64,
) -> Result<()> {
    let ordered: Vec<&String> = if delta > 0 {
        chain.iter().rev().collect()
    } else {
        chain.iter().collect()
    };

    let mut written: Vec<(Hierarchy, i64)> = Vec::with_capacity(ordered.len());
    for path in ordered {
        let hierarchy = Hierarchy::new(mount_point, path.as_str());
        if let Err(e) = apply_delta(accessor, hierarchy, delta, &mut written) {
            rollback(accessor, &written);
            return Err(e);
        }
    }
    Ok(())
}

fn apply_delta(
    accessor: &dyn CgroupAccessor,
    hierarchy: Hierarchy,
    delta: i64,
    written: &mut Vec<(Hierarchy, i64)>,
) -> Result<()> {
    let cur_quota = accessor.get_i64(&hierarchy, CPU_QUOTA_KEY)?;
    if cur_quota == UNLIMITED_QUOTA {
        return Ok(());
    }

    let next_quota = cur_quota + delta;
    accessor.set(&hierarchy, CPU_QUOTA_KEY, &next_quota.to_string())?;
    written.push((hierarchy, cur_quota));
    Ok(())
}

fn rollback(accessor: &dyn CgroupAccessor, written: &[(Hierarchy, i64)]) {
    for (hierarchy, value) in written {
        if let Err(e) = accessor.set(hierarchy, CPU_QUOTA_KEY, &value.to_string()) {
            warn!(
                cgroup = %hierarchy.path,
                quota = value,
                error = %e,
                "Failed to restore cpu quota"
            );
        }
    }
}
