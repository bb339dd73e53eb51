//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print rows as a rounded table
pub fn print_table<T: Tabled>(rows: Vec<T>) {
    if rows.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Format a quota in microseconds as cores of its period
pub fn format_cores(quota_us: i64, period_us: i64) -> String {
    if quota_us < 0 {
        return "unlimited".to_string();
    }
    if period_us <= 0 {
        return "-".to_string();
    }
    format!("{:.2}", quota_us as f64 / period_us as f64)
}

/// Format nanoseconds as a human-readable duration
pub fn format_nanos(ns: i64) -> String {
    const MS: i64 = 1_000_000;
    const SEC: i64 = 1_000 * MS;

    if ns >= SEC {
        format!("{:.2}s", ns as f64 / SEC as f64)
    } else if ns >= MS {
        format!("{:.2}ms", ns as f64 / MS as f64)
    } else {
        format!("{}ns", ns)
    }
}

/// Color a utilization percentage against the default water marks
pub fn color_utilization(util: f64) -> String {
    let formatted = format!("{:.1}%", util);
    if util >= quotaturbo::config::DEFAULT_ALARM_WATER_MARK as f64 {
        formatted.red().to_string()
    } else if util >= quotaturbo::config::DEFAULT_HIGH_WATER_MARK as f64 {
        formatted.yellow().to_string()
    } else {
        formatted.green().to_string()
    }
}
