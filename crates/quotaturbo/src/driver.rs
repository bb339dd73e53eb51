//! Quota adjustment policy
//!
//! A [`Driver`] turns the node view and the refreshed container entries into
//! a `next_quota` per container. The event based policy runs four stages in
//! a fixed order, each adding to `quota_delta`:
//! - slow fallback above the high water mark
//! - fast fallback above the alarm water mark
//! - elevation of throttled containers, vetoed when utilization swings
//! - a final clamp between the static quota and the usage-justified ceiling

use crate::cpuquota::{CpuQuota, EASING_MULTIPLE};
use crate::math::{self, ns_to_us};
use crate::procstat::{MAXIMUM_UTILIZATION, MINIMUM_UTILIZATION};
use crate::status_store::NodeStatus;
use tracing::{debug, warn};

/// Computes the quota of the next period for every tracked container
pub trait Driver: Send + Sync {
    fn adjust_quota(&self, node: &NodeStatus, quotas: &mut [&mut CpuQuota]);
}

/// Event based policy
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDriver;

impl Driver for EventDriver {
    fn adjust_quota(&self, node: &NodeStatus, quotas: &mut [&mut CpuQuota]) {
        self.slow_fallback(node, quotas);
        self.fast_fallback(node, quotas);
        if sharp_fluctuates(node) {
            warn!(
                floating_limit = node.config.cpu_floating_limit,
                "CPU utilization fluctuates too much, skipping elevation"
            );
        } else {
            self.elevate(node, quotas);
        }

        for quota in quotas.iter_mut() {
            clamp_next_quota(quota);
        }
    }
}

impl EventDriver {
    /// Give back elevated quota of containers that are not throttled
    pub(crate) fn slow_fallback(&self, node: &NodeStatus, quotas: &mut [&mut CpuQuota]) {
        let util = node.last_cpu_util();
        let high = node.config.high_water_mark as f64;
        let alarm = node.config.alarm_water_mark as f64;
        if util < high {
            return;
        }

        let coefficient = (util - high) / (alarm - high) * node.config.slow_fallback_ratio;
        for quota in quotas.iter_mut() {
            let floor = quota.static_quota();
            if (quota.cur_quota as f64) > floor && !quota.is_throttled() {
                quota.quota_delta += coefficient * (floor - quota.cur_quota as f64);
            }
        }
    }

    /// Reclaim quota from containers above their static quota, in proportion
    /// to how far above they are
    pub(crate) fn fast_fallback(&self, node: &NodeStatus, quotas: &mut [&mut CpuQuota]) {
        let util = node.last_cpu_util();
        let alarm = node.config.alarm_water_mark as f64;
        if util < alarm {
            return;
        }

        // negative: cores to take back from the node
        let sub = math::percentage_to_decimal(alarm - util) * node.total_cores;
        let excess: Vec<f64> = quotas
            .iter()
            .map(|q| (q.cur_quota as f64 / q.period as f64 - q.cpu_limit).max(0.0))
            .collect();
        let total_excess: f64 = excess.iter().sum();
        if total_excess <= 0.0 {
            return;
        }

        for (quota, excess) in quotas.iter_mut().zip(excess) {
            if excess > 0.0 {
                quota.quota_delta += (excess / total_excess) * sub * quota.period as f64;
            }
        }
    }

    /// Raise the quota of containers throttled since the previous tick
    pub(crate) fn elevate(&self, node: &NodeStatus, quotas: &mut [&mut CpuQuota]) {
        let util = node.last_cpu_util();
        let alarm = node.config.alarm_water_mark as f64;
        if alarm - util < node.config.elevate_limit {
            return;
        }

        let pressure: Vec<f64> = quotas
            .iter()
            .map(|q| {
                if !q.is_throttled() {
                    return 0.0;
                }
                // a reset counter goes backwards
                let throttled_us =
                    ns_to_us(q.cur_throttle.throttled_time - q.pre_throttle.throttled_time)
                        .max(0.0);
                let events = (q.cur_throttle.nr_throttled - q.pre_throttle.nr_throttled) as f64;
                throttled_us / events / q.period as f64
            })
            .collect();
        let total_pressure: f64 = pressure.iter().sum();
        if total_pressure == 0.0 {
            return;
        }

        let budget = total_pressure
            .min(math::percentage_to_decimal(node.config.elevate_limit) * node.total_cores);
        let coefficient = budget / total_pressure;
        for (quota, pressure) in quotas.iter_mut().zip(pressure) {
            if pressure > 0.0 {
                quota.quota_delta += coefficient * pressure * quota.period as f64;
            }
        }
    }
}

/// Whether utilization swung more than the floating limit within the history
pub fn sharp_fluctuates(node: &NodeStatus) -> bool {
    let (min, max) = node.cpu_utils.iter().fold(
        (MAXIMUM_UTILIZATION, MINIMUM_UTILIZATION),
        |(min, max), u| (min.min(u.util), max.max(u.util)),
    );
    max - min > node.config.cpu_floating_limit
}

fn clamp_next_quota(quota: &mut CpuQuota) {
    let floor = quota.static_quota();
    quota.height_limit = EASING_MULTIPLE * floor;
    quota.max_quota_next_period = quota.compute_max_next_period_quota();

    let target = quota.cur_quota as f64 + quota.quota_delta;
    quota.next_quota = target.min(quota.max_quota_next_period).max(floor) as i64;

    debug!(
        cgroup = %quota.path(),
        cur_quota = quota.cur_quota,
        delta = quota.quota_delta,
        max_quota = quota.max_quota_next_period,
        next_quota = quota.next_quota,
        "Computed next quota"
    );
}
