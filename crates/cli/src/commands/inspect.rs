//! Read-only view of container cgroups

use anyhow::{bail, Context, Result};
use colored::Colorize;
use quotaturbo::cgroup::{CPUACCT_USAGE_KEY, CPU_PERIOD_KEY, CPU_QUOTA_KEY};
use quotaturbo::{CgroupAccessor, CpuStat, FsCgroupAccessor, Hierarchy};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    format_cores, format_nanos, print_error, print_json, print_table, OutputFormat,
};

/// Quota state of one cgroup
#[derive(Debug, Serialize)]
pub struct CgroupInfo {
    pub path: String,
    pub period_us: i64,
    pub quota_us: i64,
    /// Quota in cores, absent when unlimited
    pub quota_cores: Option<f64>,
    pub throttle: CpuStat,
    pub usage_ns: i64,
}

#[derive(Tabled)]
struct CgroupRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Period")]
    period: i64,
    #[tabled(rename = "Quota")]
    quota: i64,
    #[tabled(rename = "Cores")]
    cores: String,
    #[tabled(rename = "Periods")]
    nr_periods: i64,
    #[tabled(rename = "Throttled")]
    nr_throttled: i64,
    #[tabled(rename = "Throttled Time")]
    throttled_time: String,
    #[tabled(rename = "Usage")]
    usage: String,
}

impl From<&CgroupInfo> for CgroupRow {
    fn from(info: &CgroupInfo) -> Self {
        let throttled_time = if info.throttle.nr_throttled > 0 {
            format_nanos(info.throttle.throttled_time).red().to_string()
        } else {
            format_nanos(info.throttle.throttled_time)
        };
        Self {
            path: info.path.clone(),
            period: info.period_us,
            quota: info.quota_us,
            cores: format_cores(info.quota_us, info.period_us),
            nr_periods: info.throttle.nr_periods,
            nr_throttled: info.throttle.nr_throttled,
            throttled_time,
            usage: format_nanos(info.usage_ns),
        }
    }
}

/// Read the quota attributes of a cgroup
pub fn inspect_cgroup(
    accessor: &dyn CgroupAccessor,
    cgroup_root: &Path,
    path: &str,
) -> Result<CgroupInfo> {
    let hierarchy = Hierarchy::new(cgroup_root, path);
    let period_us = accessor
        .get_i64(&hierarchy, CPU_PERIOD_KEY)
        .context("failed to read cpu period")?;
    let quota_us = accessor
        .get_i64(&hierarchy, CPU_QUOTA_KEY)
        .context("failed to read cpu quota")?;
    let throttle = accessor
        .get_cpu_stat(&hierarchy)
        .context("failed to read cpu.stat")?;
    let usage_ns = accessor
        .get_i64(&hierarchy, CPUACCT_USAGE_KEY)
        .context("failed to read cpuacct usage")?;

    let quota_cores = (quota_us >= 0 && period_us > 0).then(|| quota_us as f64 / period_us as f64);

    Ok(CgroupInfo {
        path: path.to_string(),
        period_us,
        quota_us,
        quota_cores,
        throttle,
        usage_ns,
    })
}

/// Show every readable cgroup, failing if any could not be read
pub fn show_cgroups(cgroup_root: &Path, paths: &[String], format: OutputFormat) -> Result<()> {
    let accessor = FsCgroupAccessor;
    let mut infos = Vec::with_capacity(paths.len());
    let mut failed = 0;

    for path in paths {
        match inspect_cgroup(&accessor, cgroup_root, path) {
            Ok(info) => infos.push(info),
            Err(e) => {
                failed += 1;
                print_error(&format!("{}: {:#}", path, e));
            }
        }
    }

    match format {
        OutputFormat::Json => print_json(&infos)?,
        OutputFormat::Table => print_table(infos.iter().map(CgroupRow::from).collect()),
    }

    if failed > 0 {
        bail!("{} of {} cgroups could not be read", failed, paths.len());
    }
    Ok(())
}
