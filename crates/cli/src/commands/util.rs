//! Node CPU utilization sampling

use anyhow::{Context, Result};
use colored::Colorize;
use quotaturbo::procstat::{calc_util, ProcFsStat, ProcStatSource};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::output::{color_utilization, print_json, OutputFormat};

#[derive(Debug, Serialize)]
pub struct UtilReport {
    pub interval_ms: u64,
    pub utilization: f64,
    pub busy_jiffies: f64,
    pub total_jiffies: f64,
}

/// Sample the counters twice, `interval` apart
pub async fn sample_utilization(proc_stat: &Path, interval: Duration) -> Result<UtilReport> {
    let source = ProcFsStat::with_path(proc_stat);
    let prev = source.sample().context("failed to take first sample")?;
    tokio::time::sleep(interval).await;
    let cur = source.sample().context("failed to take second sample")?;

    Ok(UtilReport {
        interval_ms: interval.as_millis() as u64,
        utilization: calc_util(&prev, &cur),
        busy_jiffies: cur.busy - prev.busy,
        total_jiffies: cur.total - prev.total,
    })
}

pub async fn show_utilization(
    proc_stat: &Path,
    interval: Duration,
    format: OutputFormat,
) -> Result<()> {
    let report = sample_utilization(proc_stat, interval).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Node CPU Utilization".bold());
            println!("{}", "=".repeat(40));
            println!("Interval:     {}ms", report.interval_ms);
            println!("Utilization:  {}", color_utilization(report.utilization));
            println!("Busy/Total:   {}/{} jiffies", report.busy_jiffies, report.total_jiffies);
        }
    }

    Ok(())
}
