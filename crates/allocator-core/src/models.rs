//! Core data models for the allocation engine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Billed products the engine knows how to redistribute.
///
/// The set is closed: callers may not widen or narrow it. Classification
/// predicates drive the allocation-factor math in
/// [`crate::report::UtilizationReport::allocation_factor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    /// Compute instance hours (allocated by CPU + memory share)
    ComputeInstance,
    /// Monitoring charges tied to compute instances
    Monitoring,
    /// Block-storage volumes (allocated by persistent-volume-claim share)
    BlockStorage,
    /// Network transfer (allocated by in+out traffic share)
    DataTransfer,
}

impl Product {
    /// All products eligible for allocation, in a fixed order.
    pub const ALL: [Product; 4] = [
        Product::ComputeInstance,
        Product::Monitoring,
        Product::BlockStorage,
        Product::DataTransfer,
    ];

    /// Stable code used in billing snapshots and log output
    pub fn code(&self) -> &'static str {
        match self {
            Product::ComputeInstance => "ComputeInstance",
            Product::Monitoring => "Monitoring",
            Product::BlockStorage => "BlockStorage",
            Product::DataTransfer => "DataTransfer",
        }
    }

    /// Instance-hours and monitoring products share the CPU+memory factor
    pub fn is_compute_like(&self) -> bool {
        matches!(self, Product::ComputeInstance | Product::Monitoring)
    }

    pub fn is_block_storage(&self) -> bool {
        matches!(self, Product::BlockStorage)
    }

    pub fn is_data_transfer(&self) -> bool {
        matches!(self, Product::DataTransfer)
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Product {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ComputeInstance" => Ok(Product::ComputeInstance),
            "Monitoring" => Ok(Product::Monitoring),
            "BlockStorage" => Ok(Product::BlockStorage),
            "DataTransfer" => Ok(Product::DataTransfer),
            other => anyhow::bail!("unknown product code: {}", other),
        }
    }
}

/// Workload type reported for a utilization row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    DaemonSet,
    Deployment,
    /// Namespace-level rollup; never allocated (would double-count its
    /// own child workloads)
    Namespace,
    Pod,
    StatefulSet,
    /// Reports without a Type column land here
    None,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::Namespace => "Namespace",
            WorkloadKind::Pod => "Pod",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::None => "",
        }
    }
}

impl FromStr for WorkloadKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DaemonSet" => Ok(WorkloadKind::DaemonSet),
            "Deployment" => Ok(WorkloadKind::Deployment),
            "Namespace" => Ok(WorkloadKind::Namespace),
            "Pod" => Ok(WorkloadKind::Pod),
            "StatefulSet" => Ok(WorkloadKind::StatefulSet),
            "" => Ok(WorkloadKind::None),
            other => anyhow::bail!("unknown workload type: {}", other),
        }
    }
}

/// Resource metrics reported for one utilization row.
///
/// Values are as parsed; empty/nan/inf cells have already been folded
/// to 0.0 by the report reader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceMetrics {
    pub requests_cpu_cores: f64,
    pub used_cpu_cores: f64,
    pub limits_cpu_cores: f64,
    pub cluster_cpu_cores: f64,
    pub requests_memory_gib: f64,
    pub used_memory_gib: f64,
    pub limits_memory_gib: f64,
    pub cluster_memory_gib: f64,
    pub network_in_gib: f64,
    pub cluster_network_in_gib: f64,
    pub network_out_gib: f64,
    pub cluster_network_out_gib: f64,
    pub persistent_volume_claim_gib: f64,
    pub cluster_persistent_volume_claim_gib: f64,
}

/// One parsed row of a utilization report. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct UtilizationRecord {
    pub cluster: String,
    pub kind: WorkloadKind,
    pub resource: String,
    pub namespace: String,
    /// Hour offset from month start for [start, end)
    pub start_hour: usize,
    pub metrics: ResourceMetrics,
    /// Empty when the report has no UsageType column
    pub usage_type: String,
    /// Passthrough values for configured copy-tag keys, in copy-tag order
    pub output_tags: Vec<String>,
}

/// Identity of one billed group per hour: product, optional usage-type
/// dimension, and the tag values referenced by the cluster-name formulas.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocationKey {
    pub product: Product,
    pub usage_type: Option<String>,
    pub tags: Vec<String>,
}

impl fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.product)?;
        if let Some(ut) = &self.usage_type {
            write!(f, "/{}", ut)?;
        }
        write!(f, "[{}]", self.tags.join(","))
    }
}

/// One destination split of a billed group's hourly cost
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationEntry {
    /// Fractional share of the group's cost. Not clamped; inconsistent
    /// utilization data can push individual fractions past 1.0 and the
    /// synthetic remainder entry negative.
    pub fraction: f64,
    /// Destination tag values aligned to the engine's output keys
    pub outputs: Vec<String>,
}

/// Full identity of a cost value in the dataset: product, usage type,
/// and the complete user-tag vector aligned to the configured tag keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagCombination {
    pub product: Product,
    pub usage_type: String,
    pub tags: Vec<String>,
}

impl TagCombination {
    pub fn new(product: Product, usage_type: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            product,
            usage_type: usage_type.into(),
            tags,
        }
    }
}

impl fmt::Display for TagCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}[{}]",
            self.product,
            self.usage_type,
            self.tags.join(",")
        )
    }
}
