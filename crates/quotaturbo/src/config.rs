//! Controller tunables

use crate::cgroup::DEFAULT_CGROUP_ROOT;
use crate::error::{Result, TurboError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_HIGH_WATER_MARK: i32 = 60;
pub const DEFAULT_ALARM_WATER_MARK: i32 = 80;
pub const DEFAULT_ELEVATE_LIMIT: f64 = 1.0;
pub const DEFAULT_SLOW_FALLBACK_RATIO: f64 = 0.1;
pub const DEFAULT_CPU_FLOATING_LIMIT: f64 = 10.0;

const MIN_PERCENTAGE: f64 = 0.0;
const MAX_PERCENTAGE: f64 = 100.0;

/// Configuration of the quota controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node utilization (%) above which unthrottled containers slowly give
    /// back elevated quota
    #[serde(alias = "highWaterMark")]
    pub high_water_mark: i32,

    /// Node utilization (%) above which quota is reclaimed fast; below it
    /// throttled containers may be elevated
    #[serde(alias = "alarmWaterMark")]
    pub alarm_water_mark: i32,

    /// Mount point of the cgroup v1 controllers
    #[serde(alias = "cgroupRoot")]
    pub cgroup_root: PathBuf,

    /// Largest single elevation, as a percentage of all node cores
    #[serde(alias = "elevateLimit")]
    pub elevate_limit: f64,

    /// Rate of the slow fallback
    #[serde(alias = "slowFallbackRatio")]
    pub slow_fallback_ratio: f64,

    /// Largest utilization swing (%) within a minute that still allows
    /// elevation; fallback is never limited
    #[serde(alias = "cpuFloatingLimit")]
    pub cpu_floating_limit: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            alarm_water_mark: DEFAULT_ALARM_WATER_MARK,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            elevate_limit: DEFAULT_ELEVATE_LIMIT,
            slow_fallback_ratio: DEFAULT_SLOW_FALLBACK_RATIO,
            cpu_floating_limit: DEFAULT_CPU_FLOATING_LIMIT,
        }
    }
}

/// A single typed change to the configuration
#[derive(Debug, Clone, PartialEq)]
pub enum TurboOption {
    WaterMark { high: i32, alarm: i32 },
    CgroupRoot(PathBuf),
    ElevateLimit(f64),
    SlowFallbackRatio(f64),
    CpuFloatingLimit(f64),
}

impl Config {
    /// Check every field
    pub fn validate(&self) -> Result<()> {
        validate_water_mark(self.high_water_mark, self.alarm_water_mark)?;
        validate_percentage("elevate_limit", self.elevate_limit)?;
        validate_percentage("cpu_floating_limit", self.cpu_floating_limit)?;
        validate_ratio(self.slow_fallback_ratio)?;
        Ok(())
    }

    /// Apply one option, rejecting invalid values without modifying `self`
    pub fn apply(&mut self, option: TurboOption) -> Result<()> {
        match option {
            TurboOption::WaterMark { high, alarm } => {
                validate_water_mark(high, alarm)?;
                self.high_water_mark = high;
                self.alarm_water_mark = alarm;
            }
            TurboOption::CgroupRoot(root) => self.cgroup_root = root,
            TurboOption::ElevateLimit(limit) => {
                validate_percentage("elevate_limit", limit)?;
                self.elevate_limit = limit;
            }
            TurboOption::SlowFallbackRatio(ratio) => {
                validate_ratio(ratio)?;
                self.slow_fallback_ratio = ratio;
            }
            TurboOption::CpuFloatingLimit(limit) => {
                validate_percentage("cpu_floating_limit", limit)?;
                self.cpu_floating_limit = limit;
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_water_mark(high: i32, alarm: i32) -> Result<()> {
    let out_of_range = |mark: i32| !(0..=100).contains(&mark);
    if alarm <= high || out_of_range(high) || out_of_range(alarm) {
        return Err(TurboError::Validation(format!(
            "alarm water mark ({}) must exceed high water mark ({}), both range from 0 to 100",
            alarm, high
        )));
    }
    Ok(())
}

fn validate_percentage(name: &str, value: f64) -> Result<()> {
    if !(MIN_PERCENTAGE..=MAX_PERCENTAGE).contains(&value) {
        return Err(TurboError::Validation(format!(
            "{} ({}) should range from {} to {}",
            name, value, MIN_PERCENTAGE, MAX_PERCENTAGE
        )));
    }
    Ok(())
}

fn validate_ratio(ratio: f64) -> Result<()> {
    if !ratio.is_finite() || ratio < 0.0 {
        return Err(TurboError::Validation(format!(
            "slow_fallback_ratio ({}) should be a non-negative number",
            ratio
        )));
    }
    Ok(())
}
