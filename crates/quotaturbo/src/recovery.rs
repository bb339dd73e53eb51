//! Restoring static pod and container quotas
//!
//! Used before the controller starts and after it stops so no pod keeps an
//! elevated (or lowered) quota that nothing adjusts anymore.

use crate::cgroup::{CgroupAccessor, Hierarchy, CPU_PERIOD_KEY, CPU_QUOTA_KEY, UNLIMITED_QUOTA};
use crate::models::{PodSpec, RecoveryReport};
use std::path::Path;
use tracing::{debug, error};

/// Set every container of `pod` back to `cpu_limit * period` and the pod to
/// the sum of its containers
///
/// The pod is made unlimited first so lowering children can never exceed
/// it. A container without limit keeps the pod unlimited. Per-container
/// failures are logged and reported; they do not stop the recovery.
pub fn recover_pod_quota(
    accessor: &dyn CgroupAccessor,
    cgroup_root: &Path,
    pod: &PodSpec,
) -> RecoveryReport {
    let unlimited = UNLIMITED_QUOTA.to_string();
    let mut report = RecoveryReport {
        pod_uid: pod.uid.clone(),
        ..RecoveryReport::default()
    };

    let pod_hierarchy = Hierarchy::new(cgroup_root, pod.cgroup_path.as_str());
    if let Err(e) = accessor.set(&pod_hierarchy, CPU_QUOTA_KEY, &unlimited) {
        error!(pod_uid = %pod.uid, error = %e, "Failed to make pod quota unlimited");
        report.failures.push((pod.cgroup_path.clone(), e.to_string()));
        return report;
    }

    let mut pod_quota: i64 = 0;
    for container in &pod.containers {
        let path = pod.container_path(container);
        let hierarchy = Hierarchy::new(cgroup_root, path.as_str());

        if container.cpu_limit == 0.0 {
            report.unlimited = true;
            match accessor.set(&hierarchy, CPU_QUOTA_KEY, &unlimited) {
                Ok(()) => {
                    report.containers_restored += 1;
                    debug!(container_id = %container.id, "Set container quota to unlimited");
                }
                Err(e) => {
                    error!(
                        container_id = %container.id,
                        error = %e,
                        "Failed to make container quota unlimited"
                    );
                    report.failures.push((path, e.to_string()));
                }
            }
            continue;
        }

        let period = match accessor.get_i64(&hierarchy, CPU_PERIOD_KEY) {
            Ok(period) => period,
            Err(e) => {
                error!(
                    container_id = %container.id,
                    error = %e,
                    "Failed to read container cpu period"
                );
                report.failures.push((path, e.to_string()));
                continue;
            }
        };

        // period is at most 1s and the limit below the node core count
        let quota = (container.cpu_limit * period as f64) as i64;
        pod_quota += quota;
        match accessor.set(&hierarchy, CPU_QUOTA_KEY, &quota.to_string()) {
            Ok(()) => {
                report.containers_restored += 1;
                debug!(container_id = %container.id, quota, "Restored container quota");
            }
            Err(e) => {
                error!(
                    container_id = %container.id,
                    error = %e,
                    "Failed to restore container quota"
                );
                report.failures.push((path, e.to_string()));
            }
        }
    }

    if !report.unlimited {
        match accessor.set(&pod_hierarchy, CPU_QUOTA_KEY, &pod_quota.to_string()) {
            Ok(()) => {
                report.pod_quota = Some(pod_quota);
                debug!(pod_uid = %pod.uid, quota = pod_quota, "Restored pod quota");
            }
            Err(e) => {
                error!(pod_uid = %pod.uid, error = %e, "Failed to restore pod quota");
                report.failures.push((pod.cgroup_path.clone(), e.to_string()));
            }
        }
    }

    report
}
