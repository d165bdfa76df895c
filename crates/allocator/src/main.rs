//! Kubernetes cost allocator - monthly billing post-processor
//!
//! This binary reads a billing snapshot and one month of Kubernetes
//! utilization reports, redistributes each cluster's billed costs
//! across the workloads that ran on it, and writes the adjusted
//! snapshot back out.

use std::path::{Path, PathBuf};

use allocator_core::{
    config::{parse_month, AllocationConfig},
    AllocationEngine, InMemoryCostDataset, ProcessorConfig, UtilizationReport,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod billing;

/// Proportional Kubernetes cost allocation over a billing snapshot
#[derive(Parser)]
#[command(name = "k8s-cost-allocator")]
#[command(author, version, about = "Allocate billed cluster costs to Kubernetes workloads", long_about = None)]
struct Cli {
    /// Allocation rule file (can also be set via ALLOCATOR_CONFIG)
    #[arg(long, short, env = "ALLOCATOR_CONFIG")]
    config: PathBuf,

    /// Month to process, YYYY-MM
    #[arg(long, short)]
    month: String,

    /// Billing snapshot CSV to read
    #[arg(long, short)]
    input: PathBuf,

    /// Adjusted billing snapshot CSV to write
    #[arg(long, short)]
    output: PathBuf,

    /// Optional JSON run summary path
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct ReportSummary {
    name: String,
    groups: usize,
    entries: usize,
    conflicts: usize,
    unprocessed_groups: usize,
    unprocessed_clusters: Vec<String>,
    inserted: usize,
    rewritten: usize,
    removed: usize,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    month: String,
    reports: Vec<ReportSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    let month = parse_month(&cli.month)?;
    info!(month = %cli.month, config = %cli.config.display(), "starting cost allocation");

    let config = ProcessorConfig::load(&cli.config)?;
    let mut dataset = billing::read_snapshot(&cli.input, &config.tag_keys)?;

    let mut summaries = Vec::new();
    // Reports share the snapshot's key space, so they run one after
    // another against the evolving dataset
    for rule in &config.reports {
        if let Some(summary) = process_rule(rule, &config.tag_keys, month, &mut dataset)? {
            summaries.push(summary);
        }
    }

    billing::write_snapshot(&cli.output, &config.tag_keys, &dataset)?;

    let run = RunSummary {
        month: cli.month.clone(),
        reports: summaries,
    };
    if let Some(path) = &cli.summary {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating summary {}", path.display()))?;
        serde_json::to_writer_pretty(file, &run).context("writing run summary")?;
        info!(file = %path.display(), "wrote run summary");
    }
    info!(reports = run.reports.len(), "cost allocation finished");
    Ok(())
}

/// Allocate one configured report source against the dataset. Inactive
/// rules and missing report files are no-ops.
fn process_rule(
    rule: &AllocationConfig,
    tag_keys: &[String],
    month: DateTime<Utc>,
    dataset: &mut InMemoryCostDataset,
) -> Result<Option<ReportSummary>> {
    if !rule.is_active(month)? {
        info!(report = %rule.name, "rule not active for month, skipping");
        return Ok(None);
    }
    let base = rule.report_path(month);
    let file = match find_report_file(&base) {
        Some(file) => file,
        None => {
            info!(report = %rule.name, path = %base.display(), "no report file for month, skipping");
            return Ok(None);
        }
    };

    let mut report = UtilizationReport::new(rule, tag_keys, month)?;
    report.load_file(&file)?;

    let engine = AllocationEngine::new(rule, tag_keys)?;
    let allocation = engine.build(&report, dataset)?;
    let apply_stats = allocation.apply(dataset);

    let build_stats = &allocation.stats;
    Ok(Some(ReportSummary {
        name: rule.name.clone(),
        groups: build_stats.groups,
        entries: build_stats.entries,
        conflicts: build_stats.conflicts,
        unprocessed_groups: build_stats.unprocessed_groups,
        unprocessed_clusters: build_stats.unprocessed_clusters.clone(),
        inserted: apply_stats.inserted,
        rewritten: apply_stats.rewritten,
        removed: apply_stats.removed,
    }))
}

/// Monthly report files come plain or gzipped. The extension is
/// appended textually; `Path::with_extension` would clobber anything
/// after a dot in the configured report prefix.
fn find_report_file(base: &Path) -> Option<PathBuf> {
    for extension in ["csv", "csv.gz"] {
        let candidate = PathBuf::from(format!("{}.{}", base.display(), extension));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_report_file_keeps_dotted_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let name = "eks.prod-kubernetes-2019-01";
        std::fs::write(dir.path().join(format!("{}.csv", name)), "").unwrap();

        let found = find_report_file(&dir.path().join(name)).unwrap();
        assert_eq!(found, dir.path().join(format!("{}.csv", name)));
    }

    #[test]
    fn test_find_report_file_prefers_plain_then_gzip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kubernetes-2019-01.csv.gz"), "").unwrap();

        let base = dir.path().join("kubernetes-2019-01");
        assert_eq!(
            find_report_file(&base).unwrap(),
            dir.path().join("kubernetes-2019-01.csv.gz")
        );

        std::fs::write(dir.path().join("kubernetes-2019-01.csv"), "").unwrap();
        assert_eq!(
            find_report_file(&base).unwrap(),
            dir.path().join("kubernetes-2019-01.csv")
        );
    }
}
