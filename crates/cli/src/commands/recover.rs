//! Manual pod quota recovery

use anyhow::{bail, Result};
use colored::Colorize;
use quotaturbo::{recover_pod_quota, ContainerSpec, FsCgroupAccessor, PodSpec};
use std::path::Path;
use tabled::Tabled;

use crate::output::{print_json, print_success, print_table, print_warning, OutputFormat};

#[derive(Tabled)]
struct FailureRow {
    #[tabled(rename = "cgroup")]
    path: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Parse a `--container ID=LIMIT` argument
pub fn parse_container(arg: &str) -> Result<ContainerSpec, String> {
    let (id, limit) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected ID=LIMIT, got {:?}", arg))?;
    if id.is_empty() {
        return Err("container id must not be empty".to_string());
    }
    let cpu_limit: f64 = limit
        .parse()
        .map_err(|e| format!("invalid cpu limit {:?}: {}", limit, e))?;
    if !cpu_limit.is_finite() || cpu_limit < 0.0 {
        return Err(format!("cpu limit must be a non-negative number, got {}", limit));
    }

    Ok(ContainerSpec {
        id: id.to_string(),
        name: id.to_string(),
        cpu_limit,
    })
}

/// Restore the static quota of one pod
pub fn recover_pod(
    cgroup_root: &Path,
    pod_path: &str,
    uid: &str,
    containers: Vec<ContainerSpec>,
    format: OutputFormat,
) -> Result<()> {
    let pod = PodSpec {
        uid: uid.to_string(),
        name: String::new(),
        cgroup_path: pod_path.to_string(),
        quota_turbo: true,
        containers,
    };
    let report = recover_pod_quota(&FsCgroupAccessor, cgroup_root, &pod);

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Pod Quota Recovery".bold());
            println!("{}", "=".repeat(50));
            println!("Pod:                  {}", pod_path.cyan());
            println!("Containers restored:  {}", report.containers_restored);
            match report.pod_quota {
                Some(quota) => println!("Pod quota:            {}us", quota),
                None if report.unlimited => println!("Pod quota:            unlimited"),
                None => println!("Pod quota:            unchanged"),
            }

            if report.is_clean() {
                print_success("Static quota restored");
            } else {
                print_warning("Some cgroups were not restored");
                print_table(
                    report
                        .failures
                        .iter()
                        .map(|(path, error)| FailureRow {
                            path: path.clone(),
                            error: error.clone(),
                        })
                        .collect(),
                );
            }
        }
    }

    if !report.is_clean() {
        bail!("{} cgroup(s) failed to recover", report.failures.len());
    }
    Ok(())
}
