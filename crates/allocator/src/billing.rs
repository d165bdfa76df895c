//! Billing snapshot CSV I/O
//!
//! The snapshot format is one line item per row: hour offset, product,
//! usage type, one column per configured tag key, cost. The writer
//! emits rows in a stable order so snapshots diff cleanly.

use std::path::Path;
use std::str::FromStr;

use allocator_core::report::MAX_MONTH_HOURS;
use allocator_core::{CostDataset, InMemoryCostDataset, Product, TagCombination};
use anyhow::{bail, Context, Result};
use tracing::info;

const FIXED_COLUMNS_BEFORE_TAGS: [&str; 3] = ["Hour", "Product", "UsageType"];
const COST_COLUMN: &str = "Cost";

/// Read a snapshot into memory, checking the header against the
/// configured tag-key universe
pub fn read_snapshot(path: &Path, tag_keys: &[String]) -> Result<InMemoryCostDataset> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening billing snapshot {}", path.display()))?;

    let headers = reader.headers().context("reading snapshot header")?;
    let expected: Vec<&str> = FIXED_COLUMNS_BEFORE_TAGS
        .iter()
        .copied()
        .chain(tag_keys.iter().map(String::as_str))
        .chain([COST_COLUMN])
        .collect();
    let actual: Vec<&str> = headers.iter().collect();
    if actual != expected {
        bail!(
            "snapshot header {:?} does not match configured tag keys (expected {:?})",
            actual,
            expected
        );
    }

    let mut dataset = InMemoryCostDataset::default();
    let mut rows = 0u64;
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("snapshot line {}", line + 2))?;
        let hour: usize = record
            .get(0)
            .unwrap_or("")
            .parse()
            .with_context(|| format!("snapshot line {}", line + 2))?;
        // A corrupt hour would balloon the hour-indexed storage
        if hour > MAX_MONTH_HOURS {
            bail!(
                "snapshot line {}: hour {} is past the end of a month",
                line + 2,
                hour
            );
        }
        let product = Product::from_str(record.get(1).unwrap_or(""))
            .with_context(|| format!("snapshot line {}", line + 2))?;
        let usage_type = record.get(2).unwrap_or("").to_string();
        let tags: Vec<String> = (0..tag_keys.len())
            .map(|i| record.get(3 + i).unwrap_or("").to_string())
            .collect();
        let cost: f64 = record
            .get(3 + tag_keys.len())
            .unwrap_or("")
            .parse()
            .with_context(|| format!("snapshot line {}", line + 2))?;
        dataset.insert(hour, TagCombination::new(product, usage_type, tags), cost);
        rows += 1;
    }
    info!(file = %path.display(), rows, hours = dataset.hours(), "read billing snapshot");
    Ok(dataset)
}

/// Write the dataset back out, rows ordered by hour, product, usage
/// type and tags
pub fn write_snapshot(path: &Path, tag_keys: &[String], dataset: &InMemoryCostDataset) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating billing snapshot {}", path.display()))?;

    let header: Vec<&str> = FIXED_COLUMNS_BEFORE_TAGS
        .iter()
        .copied()
        .chain(tag_keys.iter().map(String::as_str))
        .chain([COST_COLUMN])
        .collect();
    writer.write_record(&header)?;

    let mut rows = 0u64;
    for hour in 0..dataset.hours() {
        let mut entries: Vec<(&TagCombination, f64)> = dataset.entries(hour).collect();
        entries.sort_by(|(a, _), (b, _)| {
            a.product
                .code()
                .cmp(b.product.code())
                .then_with(|| a.usage_type.cmp(&b.usage_type))
                .then_with(|| a.tags.cmp(&b.tags))
        });
        for (combination, cost) in entries {
            let mut row: Vec<String> = Vec::with_capacity(header.len());
            row.push(hour.to_string());
            row.push(combination.product.code().to_string());
            row.push(combination.usage_type.clone());
            row.extend(combination.tags.iter().cloned());
            row.push(format!("{:.10}", cost));
            writer.write_record(&row)?;
            rows += 1;
        }
    }
    writer.flush()?;
    info!(file = %path.display(), rows, "wrote billing snapshot");
    Ok(())
}
