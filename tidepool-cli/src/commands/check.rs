//! `tidepool check`: validate a project config and show resolved partitions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use tidepool_core::config::{self, config_path_at};
use tidepool_core::ProjectConfig;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Project root (default: current directory).
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        let config = config::load_at(&self.dir).with_context(|| {
            format!("invalid project at {}", config_path_at(&self.dir).display())
        })?;
        let report = build_report(&self.dir, &config);
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize check JSON")?
            );
            return Ok(());
        }
        print_table(report);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CheckReport {
    name: String,
    authorization: String,
    ignored_keys: Vec<String>,
    partitions: Vec<PartitionRow>,
}

#[derive(Debug, Serialize, Tabled)]
struct PartitionRow {
    #[tabled(rename = "partition")]
    name: String,
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "target")]
    target: String,
    #[tabled(rename = "status")]
    status: String,
}

fn build_report(root: &std::path::Path, config: &ProjectConfig) -> CheckReport {
    let partitions = config
        .partitions
        .iter()
        .map(|spec| {
            let resolved = spec.resolve(root);
            let status = if resolved.is_dir() {
                "directory"
            } else if resolved.is_file() {
                "file"
            } else {
                "missing"
            };
            PartitionRow {
                name: spec.name.clone(),
                path: spec.path.display().to_string(),
                target: spec.target.clone(),
                status: status.to_string(),
            }
        })
        .collect();
    CheckReport {
        name: config.name.to_string(),
        authorization: config.policy.to_string(),
        ignored_keys: config.ignored_keys.clone(),
        partitions,
    }
}

fn print_table(report: CheckReport) {
    println!(
        "{} {} | place ids: {}",
        "project".bold(),
        report.name.green(),
        report.authorization
    );
    for key in &report.ignored_keys {
        println!("{} unknown key '{key}' ignored", "warning:".yellow());
    }
    let missing = report
        .partitions
        .iter()
        .filter(|row| row.status == "missing")
        .count();
    let mut table = Table::new(report.partitions);
    table.with(Style::rounded());
    println!("{table}");
    if missing > 0 {
        println!(
            "{}",
            format!("{missing} partition path(s) missing; they will be skipped").yellow()
        );
    }
}
