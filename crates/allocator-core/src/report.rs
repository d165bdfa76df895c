//! Utilization report loading and indexing
//!
//! Reads one calendar month of Kubernetes utilization rows (CSV,
//! optionally gzipped) into a cluster -> hour -> records index, and
//! computes per-row allocation factors. Column discovery is header
//! driven; a malformed row is logged and skipped without aborting the
//! scan.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use tracing::{error, info, warn};

use crate::config::AllocationConfig;
use crate::formula::FormulaEvaluator;
use crate::models::{Product, ResourceMetrics, UtilizationRecord, WorkloadKind};

/// Fixed weight converting one vCPU-hour into memory-GiB-equivalent
/// cost units for the compute-like allocation factor
pub const VCPU_TO_MEMORY_COST_RATIO: f64 = 10.9;

/// Upper bound on hour offsets within one month (31 days)
pub const MAX_MONTH_HOURS: usize = 31 * 24;

/// Progress logging interval while scanning large reports
const PROGRESS_LINES: u64 = 500_000;

/// Known report columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Cluster,
    Type,
    Resource,
    Namespace,
    StartDate,
    EndDate,
    RequestsCpuCores,
    UsedCpuCores,
    LimitsCpuCores,
    ClusterCpuCores,
    RequestsMemoryGib,
    UsedMemoryGib,
    LimitsMemoryGib,
    ClusterMemoryGib,
    NetworkInGib,
    ClusterNetworkInGib,
    NetworkOutGib,
    ClusterNetworkOutGib,
    PersistentVolumeClaimGib,
    ClusterPersistentVolumeClaimGib,
    UsageType,
}

impl Column {
    const ALL: [Column; 21] = [
        Column::Cluster,
        Column::Type,
        Column::Resource,
        Column::Namespace,
        Column::StartDate,
        Column::EndDate,
        Column::RequestsCpuCores,
        Column::UsedCpuCores,
        Column::LimitsCpuCores,
        Column::ClusterCpuCores,
        Column::RequestsMemoryGib,
        Column::UsedMemoryGib,
        Column::LimitsMemoryGib,
        Column::ClusterMemoryGib,
        Column::NetworkInGib,
        Column::ClusterNetworkInGib,
        Column::NetworkOutGib,
        Column::ClusterNetworkOutGib,
        Column::PersistentVolumeClaimGib,
        Column::ClusterPersistentVolumeClaimGib,
        Column::UsageType,
    ];

    fn name(&self) -> &'static str {
        match self {
            Column::Cluster => "Cluster",
            Column::Type => "Type",
            Column::Resource => "Resource",
            Column::Namespace => "Namespace",
            Column::StartDate => "StartDate",
            Column::EndDate => "EndDate",
            Column::RequestsCpuCores => "RequestsCPUCores",
            Column::UsedCpuCores => "UsedCPUCores",
            Column::LimitsCpuCores => "LimitsCPUCores",
            Column::ClusterCpuCores => "ClusterCPUCores",
            Column::RequestsMemoryGib => "RequestsMemoryGiB",
            Column::UsedMemoryGib => "UsedMemoryGiB",
            Column::LimitsMemoryGib => "LimitsMemoryGiB",
            Column::ClusterMemoryGib => "ClusterMemoryGiB",
            Column::NetworkInGib => "NetworkInGiB",
            Column::ClusterNetworkInGib => "ClusterNetworkInGiB",
            Column::NetworkOutGib => "NetworkOutGiB",
            Column::ClusterNetworkOutGib => "ClusterNetworkOutGiB",
            Column::PersistentVolumeClaimGib => "PersistentVolumeClaimGiB",
            Column::ClusterPersistentVolumeClaimGib => "ClusterPersistentVolumeClaimGiB",
            Column::UsageType => "UsageType",
        }
    }

    fn from_name(name: &str) -> Option<Column> {
        Column::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Reports may omit these without an error-level log
    fn is_optional(&self) -> bool {
        matches!(
            self,
            Column::Type
                | Column::Resource
                | Column::UsedCpuCores
                | Column::UsedMemoryGib
                | Column::LimitsCpuCores
                | Column::LimitsMemoryGib
                | Column::UsageType
        )
    }
}

/// Resolved column positions for one report file
#[derive(Debug)]
struct HeaderIndex {
    columns: HashMap<Column, usize>,
    /// Positions of configured copy-tag passthrough columns, aligned to
    /// the rule's copy-tag order
    copy_columns: Vec<Option<usize>>,
}

impl HeaderIndex {
    fn get<'r>(&self, record: &'r csv::StringRecord, col: Column) -> &'r str {
        self.columns
            .get(&col)
            .and_then(|&i| record.get(i))
            .unwrap_or("")
    }
}

/// Cluster -> hour -> records, built arena-style at load time.
///
/// Hour bucket sequences only ever grow within one load; the explicit
/// extend keeps bucket indices addressable without resize-on-access.
#[derive(Debug, Default)]
struct ClusterHourIndex {
    clusters: HashMap<String, Vec<Vec<UtilizationRecord>>>,
}

impl ClusterHourIndex {
    fn bucket(&mut self, cluster: &str, hour: usize) -> &mut Vec<UtilizationRecord> {
        let hours = self.clusters.entry(cluster.to_string()).or_default();
        Self::extend_to(hours, hour);
        &mut hours[hour]
    }

    fn extend_to(hours: &mut Vec<Vec<UtilizationRecord>>, hour: usize) {
        while hours.len() <= hour {
            hours.push(Vec::new());
        }
    }

    fn contains(&self, cluster: &str) -> bool {
        self.clusters.contains_key(cluster)
    }

    fn records(&self, cluster: &str, hour: usize) -> &[UtilizationRecord] {
        self.clusters
            .get(cluster)
            .and_then(|hours| hours.get(hour))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Scan statistics for one report load
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    /// Data lines seen (header excluded)
    pub lines: u64,
    /// Rows accepted into the index
    pub rows: u64,
    /// Rows dropped for parse or range errors
    pub skipped: u64,
    /// Latest row end seen, as an hour offset from month start
    pub end_hour: usize,
}

/// One month of indexed utilization data for a configured source
pub struct UtilizationReport {
    name: String,
    month: DateTime<Utc>,
    evaluator: FormulaEvaluator,
    /// Passthrough column names, in configured copy-tag order
    copy_columns: Vec<String>,
    index: ClusterHourIndex,
    has_usage_type: bool,
}

impl UtilizationReport {
    /// Build an empty report for one configured source. Fails when the
    /// rule's formulas do not compile against the tag-key universe.
    pub fn new(
        config: &AllocationConfig,
        tag_keys: &[String],
        month: DateTime<Utc>,
    ) -> Result<Self> {
        let evaluator = FormulaEvaluator::compile(&config.cluster_name_formulae, tag_keys)?;
        let copy_columns: Vec<String> = config
            .copy_tags
            .iter()
            .map(|c| c.column().to_string())
            .collect();
        Ok(Self {
            name: config.name.clone(),
            month,
            evaluator,
            copy_columns,
            index: ClusterHourIndex::default(),
            has_usage_type: false,
        })
    }

    pub fn evaluator(&self) -> &FormulaEvaluator {
        &self.evaluator
    }

    /// Whether the loaded file carried a UsageType column
    pub fn has_usage_type(&self) -> bool {
        self.has_usage_type
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.index.clusters.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.index.clusters.is_empty()
    }

    /// Records for one cluster hour; empty when the cluster or hour is
    /// unknown
    pub fn records(&self, cluster: &str, hour: usize) -> &[UtilizationRecord] {
        self.index.records(cluster, hour)
    }

    /// First candidate name (formula declaration order) present in the
    /// index, or None when no candidate matches
    pub fn resolve_cluster_name(&self, tags: &[String]) -> Option<String> {
        self.evaluator
            .candidate_names(tags)
            .into_iter()
            .find(|name| self.index.contains(name))
    }

    /// Load a report file; `.gz` suffixed files are decompressed on the
    /// fly
    pub fn load_file(&mut self, path: &Path) -> Result<LoadStats> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let name = path.display().to_string();
        info!(report = %self.name, file = %name, "loading utilization report");
        let stats = if path.extension().is_some_and(|e| e == "gz") {
            self.read_from(&name, GzDecoder::new(file))?
        } else {
            self.read_from(&name, file)?
        };
        info!(
            report = %self.name,
            file = %name,
            lines = stats.lines,
            rows = stats.rows,
            skipped = stats.skipped,
            clusters = self.index.clusters.len(),
            "loaded utilization report"
        );
        Ok(stats)
    }

    /// Streaming scan of report CSV. Row errors are logged and the row
    /// dropped; the scan itself only fails on unreadable input.
    pub fn read_from(&mut self, source: &str, reader: impl Read) -> Result<LoadStats> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .with_context(|| format!("reading header of {}", source))?
            .clone();
        let header = self.resolve_header(&headers);

        let mut stats = LoadStats::default();
        for result in csv_reader.records() {
            stats.lines += 1;
            if stats.lines % PROGRESS_LINES == 0 {
                info!(source, lines = stats.lines, "scanning utilization report...");
            }
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    error!(source, line = stats.lines, error = %e, "unreadable row, skipping");
                    stats.skipped += 1;
                    continue;
                }
            };
            match self.process_row(&header, &record) {
                Ok(end_hour) => {
                    stats.rows += 1;
                    stats.end_hour = stats.end_hour.max(end_hour);
                }
                Err(e) => {
                    error!(source, line = stats.lines, error = %e, "dropping row");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Match each header cell against the known column set and the
    /// configured passthrough columns
    fn resolve_header(&mut self, headers: &csv::StringRecord) -> HeaderIndex {
        let mut columns = HashMap::new();
        let mut copy_columns = vec![None; self.copy_columns.len()];
        let mut unreferenced = Vec::new();
        let mut empty = Vec::new();

        for (i, cell) in headers.iter().enumerate() {
            if let Some(pos) = self.copy_columns.iter().position(|c| c == cell) {
                copy_columns[pos] = Some(i);
            } else if let Some(col) = Column::from_name(cell) {
                columns.insert(col, i);
            } else if cell.is_empty() {
                empty.push(i);
            } else {
                unreferenced.push(cell.to_string());
            }
        }

        if !empty.is_empty() {
            warn!(report = %self.name, columns = ?empty, "empty columns in utilization report");
        }
        if !unreferenced.is_empty() {
            info!(report = %self.name, columns = ?unreferenced, "unreferenced columns in utilization report");
        }

        let mut missing_optional = Vec::new();
        let mut missing_mandatory = Vec::new();
        for col in Column::ALL {
            if !columns.contains_key(&col) {
                if col.is_optional() {
                    missing_optional.push(col.name());
                } else {
                    missing_mandatory.push(col.name());
                }
            }
        }
        if !missing_optional.is_empty() {
            info!(report = %self.name, columns = ?missing_optional, "report lacks optional columns");
        }
        if !missing_mandatory.is_empty() {
            // Affected values fall back to 0.0 via the missing-value
            // rule; the run continues.
            error!(report = %self.name, columns = ?missing_mandatory, "report lacks mandatory columns");
        }

        self.has_usage_type = columns.contains_key(&Column::UsageType);
        HeaderIndex {
            columns,
            copy_columns,
        }
    }

    /// Parse one row and append it to its cluster-hour bucket.
    /// Returns the row's end-hour offset for the load watermark.
    fn process_row(&mut self, header: &HeaderIndex, record: &csv::StringRecord) -> Result<usize> {
        let start = parse_timestamp(header.get(record, Column::StartDate))
            .context("bad StartDate")?;
        let end = parse_timestamp(header.get(record, Column::EndDate)).context("bad EndDate")?;

        let start_offset = (start - self.month).num_seconds();
        let end_offset = (end - self.month).num_seconds() + 1;
        let start_hour = start_offset.div_euclid(3600);
        let end_hour = end_offset.div_euclid(3600);

        if start_offset < 0 || start_hour > MAX_MONTH_HOURS as i64 {
            anyhow::bail!(
                "StartDate {} outside month starting {}",
                start.format("%Y-%m-%dT%H:%M:%SZ"),
                self.month.format("%Y-%m")
            );
        }
        if end_hour > start_hour + 1 {
            anyhow::bail!(
                "EndDate {} more than one hour after StartDate {}",
                end.format("%Y-%m-%dT%H:%M:%SZ"),
                start.format("%Y-%m-%dT%H:%M:%SZ")
            );
        }
        let start_hour = start_hour as usize;

        let cluster = header.get(record, Column::Cluster).to_string();
        let kind = WorkloadKind::from_str(header.get(record, Column::Type))?;

        let metrics = ResourceMetrics {
            requests_cpu_cores: parse_metric(header.get(record, Column::RequestsCpuCores))?,
            used_cpu_cores: parse_metric(header.get(record, Column::UsedCpuCores))?,
            limits_cpu_cores: parse_metric(header.get(record, Column::LimitsCpuCores))?,
            cluster_cpu_cores: parse_metric(header.get(record, Column::ClusterCpuCores))?,
            requests_memory_gib: parse_metric(header.get(record, Column::RequestsMemoryGib))?,
            used_memory_gib: parse_metric(header.get(record, Column::UsedMemoryGib))?,
            limits_memory_gib: parse_metric(header.get(record, Column::LimitsMemoryGib))?,
            cluster_memory_gib: parse_metric(header.get(record, Column::ClusterMemoryGib))?,
            network_in_gib: parse_metric(header.get(record, Column::NetworkInGib))?,
            cluster_network_in_gib: parse_metric(header.get(record, Column::ClusterNetworkInGib))?,
            network_out_gib: parse_metric(header.get(record, Column::NetworkOutGib))?,
            cluster_network_out_gib: parse_metric(
                header.get(record, Column::ClusterNetworkOutGib),
            )?,
            persistent_volume_claim_gib: parse_metric(
                header.get(record, Column::PersistentVolumeClaimGib),
            )?,
            cluster_persistent_volume_claim_gib: parse_metric(
                header.get(record, Column::ClusterPersistentVolumeClaimGib),
            )?,
        };

        let output_tags = header
            .copy_columns
            .iter()
            .map(|idx| {
                idx.and_then(|i| record.get(i))
                    .unwrap_or("")
                    .to_string()
            })
            .collect();

        let row = UtilizationRecord {
            kind,
            resource: header.get(record, Column::Resource).to_string(),
            namespace: header.get(record, Column::Namespace).to_string(),
            start_hour,
            metrics,
            usage_type: header.get(record, Column::UsageType).to_string(),
            output_tags,
            cluster: cluster.clone(),
        };
        self.index.bucket(&cluster, start_hour).push(row);
        Ok(end_hour.max(0) as usize)
    }

    /// The row's fractional share of its cluster for one product.
    ///
    /// Non-positive cluster denominators yield 0. Factors are not
    /// clamped to [0,1]; inconsistent reports can exceed 1 (see the
    /// engine's remainder handling).
    pub fn allocation_factor(&self, product: Product, record: &UtilizationRecord) -> f64 {
        let m = &record.metrics;
        if product.is_compute_like() {
            let cpu = m.requests_cpu_cores.max(m.used_cpu_cores);
            let mem = m.requests_memory_gib.max(m.used_memory_gib);
            let units = cpu * VCPU_TO_MEMORY_COST_RATIO + mem;
            let cluster_units =
                m.cluster_cpu_cores * VCPU_TO_MEMORY_COST_RATIO + m.cluster_memory_gib;
            ratio(units, cluster_units)
        } else if product.is_block_storage() {
            ratio(
                m.persistent_volume_claim_gib,
                m.cluster_persistent_volume_claim_gib,
            )
        } else if product.is_data_transfer() {
            ratio(
                m.network_in_gib + m.network_out_gib,
                m.cluster_network_in_gib + m.cluster_network_out_gib,
            )
        } else {
            0.0
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad timestamp: {:?}", s))?;
    Ok(dt.with_timezone(&Utc))
}

/// Report metric cells: empty, "nan" and "inf" (any case) count as 0.0;
/// other non-numeric text is a row error
fn parse_metric(s: &str) -> Result<f64> {
    if s.is_empty() || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("inf") {
        return Ok(0.0);
    }
    s.parse::<f64>()
        .with_context(|| format!("bad numeric value: {:?}", s))
}
