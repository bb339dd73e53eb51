//! Pods and containers as seen by the service layer

use serde::{Deserialize, Serialize};

/// A container and its static CPU limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Limit in cores; 0 means the container is not limited
    #[serde(default)]
    pub cpu_limit: f64,
}

/// A pod scheduled on this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    /// cgroup path of the pod relative to the controller mount point
    pub cgroup_path: String,
    /// Whether the pod opted into quota adjustment
    #[serde(default)]
    pub quota_turbo: bool,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

impl PodSpec {
    /// cgroup path of one of the pod's containers
    pub fn container_path(&self, container: &ContainerSpec) -> String {
        format!("{}/{}", self.cgroup_path.trim_end_matches('/'), container.id)
    }
}

/// What a pod quota recovery did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub pod_uid: String,
    /// Containers whose quota was set
    pub containers_restored: usize,
    /// At least one container has no limit, so neither does the pod
    pub unlimited: bool,
    /// Quota written to the pod, if any
    pub pod_quota: Option<i64>,
    /// Failures as (cgroup path, message)
    pub failures: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_path() {
        let pod = PodSpec {
            uid: "uid-1".into(),
            name: "web".into(),
            cgroup_path: "kubepods/burstable/poduid-1/".into(),
            quota_turbo: true,
            containers: vec![],
        };
        let container = ContainerSpec {
            id: "abc123".into(),
            name: "nginx".into(),
            cpu_limit: 1.5,
        };
        assert_eq!(
            pod.container_path(&container),
            "kubepods/burstable/poduid-1/abc123"
        );
    }

    #[test]
    fn test_pod_deserialize_defaults() {
        let pod: PodSpec = serde_json::from_str(
            r#"{"uid": "u", "cgroup_path": "kubepods/podu", "containers": [{"id": "c1"}]}"#,
        )
        .unwrap();
        assert!(!pod.quota_turbo);
        assert_eq!(pod.containers[0].cpu_limit, 0.0);
    }
}
