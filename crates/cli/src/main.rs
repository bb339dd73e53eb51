//! Quota turbo CLI
//!
//! A command-line tool for inspecting container cgroups, sampling node
//! utilization and restoring static pod quotas on a node.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{inspect, recover, util};
use quotaturbo::cgroup::DEFAULT_CGROUP_ROOT;
use quotaturbo::procstat::PROC_STAT_PATH;
use quotaturbo::ContainerSpec;
use std::path::PathBuf;
use std::time::Duration;

/// Quota turbo CLI
#[derive(Parser)]
#[command(name = "qtctl")]
#[command(author, version, about = "CLI for the quota turbo controller", long_about = None)]
pub struct Cli {
    /// Mount point of the cgroup v1 controllers
    #[arg(long, env = "QTCTL_CGROUP_ROOT", default_value = DEFAULT_CGROUP_ROOT, global = true)]
    pub cgroup_root: PathBuf,

    /// Output format
    #[arg(long = "output", short = 'o', default_value = "table", global = true)]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show quota, throttling and usage of cgroups
    Inspect {
        /// cgroup paths relative to the controller mount point
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Sample node CPU utilization
    Util {
        /// Time between the two samples
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Proc stat file to sample
        #[arg(long, default_value = PROC_STAT_PATH)]
        proc_stat: PathBuf,
    },

    /// Restore the static quota of a pod and its containers
    Recover {
        /// cgroup path of the pod
        #[arg(long)]
        pod_path: String,

        /// Pod UID, used in the report only
        #[arg(long, default_value = "")]
        uid: String,

        /// Container as ID=LIMIT in cores, 0 for no limit (repeatable)
        #[arg(long = "container", value_parser = recover::parse_container)]
        containers: Vec<ContainerSpec>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { paths } => {
            inspect::show_cgroups(&cli.cgroup_root, &paths, cli.format)?;
        }
        Commands::Util {
            interval_ms,
            proc_stat,
        } => {
            util::show_utilization(&proc_stat, Duration::from_millis(interval_ms), cli.format)
                .await?;
        }
        Commands::Recover {
            pod_path,
            uid,
            containers,
        } => {
            recover::recover_pod(&cli.cgroup_root, &pod_path, &uid, containers, cli.format)?;
        }
    }

    Ok(())
}
