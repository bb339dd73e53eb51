//! Node CPU utilization sampling from /proc/stat

use crate::error::{Result, TurboError};
use crate::math;
use std::fs;
use std::path::PathBuf;

pub const PROC_STAT_PATH: &str = "/proc/stat";

pub const MAXIMUM_UTILIZATION: f64 = 100.0;
pub const MINIMUM_UTILIZATION: f64 = 0.0;

/// Number of numeric fields required on the aggregate cpu line
const STAT_FIELDS_COUNT: usize = 10;

/// Aggregate CPU counters from the first line of /proc/stat
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcStat {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
    pub guest: f64,
    pub guest_nice: f64,
    pub busy: f64,
    pub total: f64,
}

impl ProcStat {
    /// Parse the contents of /proc/stat
    ///
    /// Format of the first line:
    /// `cpu user nice system idle iowait irq softirq steal guest guest_nice`
    pub fn parse(content: &str) -> Result<Self> {
        let line = content.lines().next().unwrap_or_default();
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < STAT_FIELDS_COUNT + 1 {
            return Err(TurboError::parse(
                PROC_STAT_PATH,
                "too few fields, check the kernel version",
            ));
        }

        let mut fields = [0f64; STAT_FIELDS_COUNT];
        for (field, raw) in fields.iter_mut().zip(&parts[1..=STAT_FIELDS_COUNT]) {
            *field = raw
                .parse()
                .map_err(|e| TurboError::parse(PROC_STAT_PATH, format!("{:?}: {}", raw, e)))?;
        }

        let [user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice] = fields;
        let busy = user + system + nice + iowait + irq + softirq + steal;

        Ok(Self {
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
            guest,
            guest_nice,
            busy,
            total: busy + idle,
        })
    }
}

/// Utilization percentage between two samples, always within [0, 100]
pub fn calc_util(prev: &ProcStat, cur: &ProcStat) -> f64 {
    if cur.busy <= prev.busy {
        return MINIMUM_UTILIZATION;
    }
    if cur.total <= prev.total {
        return MAXIMUM_UTILIZATION;
    }
    (math::div(cur.busy - prev.busy, cur.total - prev.total) * MAXIMUM_UTILIZATION)
        .clamp(MINIMUM_UTILIZATION, MAXIMUM_UTILIZATION)
}

/// Source of system-wide CPU counters
pub trait ProcStatSource: Send + Sync {
    fn sample(&self) -> Result<ProcStat>;
}

/// Reads the counters from a proc filesystem
#[derive(Debug, Clone)]
pub struct ProcFsStat {
    path: PathBuf,
}

impl ProcFsStat {
    /// Create a source reading from a custom path (for testing)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcFsStat {
    fn default() -> Self {
        Self::with_path(PROC_STAT_PATH)
    }
}

impl ProcStatSource for ProcFsStat {
    fn sample(&self) -> Result<ProcStat> {
        let content = fs::read_to_string(&self.path).map_err(|source| TurboError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        ProcStat::parse(&content)
    }
}
