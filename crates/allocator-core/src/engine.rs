//! Proportional cost allocation
//!
//! Builds an hourly allocation report (billed tag groups -> fractional
//! entries derived from utilization rows) and applies it to a cost
//! dataset as a single insert/remove delta.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use tracing::{debug, error, info, warn};

use crate::config::AllocationConfig;
use crate::dataset::CostDataset;
use crate::models::{
    AllocationEntry, AllocationKey, Product, TagCombination, UtilizationRecord, WorkloadKind,
};
use crate::report::{UtilizationReport, MAX_MONTH_HOURS};
use crate::tagger::OutputTagger;

/// Fraction sums within this distance of 1 need no synthetic
/// remainder entry; residual costs below it drop the original item
pub const REMAINDER_THRESHOLD: f64 = 1e-4;

/// Sentinel tag value for unallocated cluster capacity
pub const UNUSED: &str = "unused";

/// Build-phase counters, surfaced in the run summary
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    /// Billed groups that resolved to a cluster
    pub groups: usize,
    /// Allocation entries across all hours
    pub entries: usize,
    /// Groups dropped because their cluster was already claimed
    pub conflicts: usize,
    /// Groups whose formulas matched no cluster in the report
    pub unprocessed_groups: usize,
    /// Report clusters never claimed by any billed group
    pub unprocessed_clusters: Vec<String>,
}

/// Fractional allocation entries per hour and billed group
pub struct AllocationReport {
    /// hour -> group key -> entries
    hours: Vec<HashMap<AllocationKey, Vec<AllocationEntry>>>,
    /// group key -> member billed combinations
    groups: HashMap<AllocationKey, Vec<TagCombination>>,
    /// Tag-universe indices the entry outputs overlay, aligned to
    /// `AllocationEntry::outputs`
    output_indices: Vec<usize>,
    pub stats: BuildStats,
}

/// Pending dataset mutations computed against one snapshot.
///
/// Must be applied at most once; applying a delta twice would allocate
/// already-allocated costs again.
#[derive(Debug, Default)]
pub struct AllocationDelta {
    /// Amounts added onto the destination's current cost
    inserts: Vec<(usize, TagCombination, f64)>,
    /// Residuals replacing an original item's cost
    overwrites: Vec<(usize, TagCombination, f64)>,
    /// Original items fully consumed by their allocations
    removes: Vec<(usize, TagCombination)>,
}

impl AllocationDelta {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.overwrites.is_empty() && self.removes.is_empty()
    }

    /// Merge into the dataset. Originals are settled before allocated
    /// amounts land so that a destination colliding with a consumed
    /// original starts from its residual, not its pre-allocation cost.
    pub fn apply_to(&self, dataset: &mut dyn CostDataset) -> ApplyStats {
        for (hour, combination) in &self.removes {
            dataset.remove(*hour, combination);
        }
        for (hour, combination, residual) in &self.overwrites {
            dataset.put(*hour, combination, *residual);
        }
        for (hour, combination, amount) in &self.inserts {
            let current = dataset.get(*hour, combination);
            dataset.put(*hour, combination, current + amount);
        }
        ApplyStats {
            inserted: self.inserts.len(),
            rewritten: self.overwrites.len(),
            removed: self.removes.len(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    pub inserted: usize,
    pub rewritten: usize,
    pub removed: usize,
}

/// Builds allocation reports for one configured source
pub struct AllocationEngine<'a> {
    config: &'a AllocationConfig,
    tag_keys: &'a [String],
    tagger: OutputTagger,
}

impl<'a> AllocationEngine<'a> {
    pub fn new(config: &'a AllocationConfig, tag_keys: &'a [String]) -> Result<Self> {
        let tagger = OutputTagger::new(config)?;
        Ok(Self {
            config,
            tag_keys,
            tagger,
        })
    }

    fn tag_index(&self, key: &str) -> Result<usize> {
        self.tag_keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| anyhow!("output tag key {:?} is not a configured tag key", key))
    }

    /// Destination indices in the tag universe, in entry-output order:
    /// kind and resource when configured, namespace, then tagger keys
    fn output_indices(&self) -> Result<Vec<usize>> {
        let out = &self.config.out;
        let mut indices = Vec::new();
        if let Some(key) = &out.kind {
            indices.push(self.tag_index(key)?);
        }
        if let Some(key) = &out.resource {
            indices.push(self.tag_index(key)?);
        }
        indices.push(self.tag_index(&out.namespace)?);
        for key in self.tagger.keys() {
            indices.push(self.tag_index(key)?);
        }
        Ok(indices)
    }

    fn entry_outputs(&self, record: &UtilizationRecord) -> Vec<String> {
        let out = &self.config.out;
        let mut outputs = Vec::new();
        if out.kind.is_some() {
            outputs.push(record.kind.as_str().to_string());
        }
        if out.resource.is_some() {
            outputs.push(record.resource.clone());
        }
        outputs.push(record.namespace.clone());
        outputs.extend(self.tagger.values(record));
        outputs
    }

    /// Entry for cluster capacity no workload accounted for. Structural
    /// slots carry the sentinel; tagger slots stay empty.
    fn unused_outputs(&self) -> Vec<String> {
        let out = &self.config.out;
        let structural = 1 + out.kind.is_some() as usize + out.resource.is_some() as usize;
        let mut outputs = vec![UNUSED.to_string(); structural];
        outputs.extend(self.tagger.keys().iter().map(|_| String::new()));
        outputs
    }

    /// Group the dataset's billed combinations by allocation key,
    /// resolve each group to a report cluster, and compute fractional
    /// entries for every hour the cluster has rows.
    pub fn build(
        &self,
        report: &UtilizationReport,
        dataset: &dyn CostDataset,
    ) -> Result<AllocationReport> {
        let evaluator = report.evaluator();
        let mut groups: HashMap<AllocationKey, Vec<TagCombination>> = HashMap::new();
        let mut cluster_by_key: HashMap<AllocationKey, String> = HashMap::new();
        // Every product (and usage type) legitimately bills against the
        // same clusters, so a claim is scoped to its product/usage-type
        // dimension; only two distinct tag-value groups fighting over
        // one cluster within that scope is a conflict.
        let mut claimed: HashMap<(Product, Option<String>, String), AllocationKey> = HashMap::new();
        let mut dropped: HashSet<AllocationKey> = HashSet::new();
        let mut stats = BuildStats::default();

        for product in Product::ALL {
            for combination in dataset.combinations(product) {
                let key = AllocationKey {
                    product,
                    usage_type: report
                        .has_usage_type()
                        .then(|| combination.usage_type.clone()),
                    tags: evaluator.referenced_tag_values(&combination.tags),
                };
                if dropped.contains(&key) {
                    continue;
                }
                if let Some(members) = groups.get_mut(&key) {
                    members.push(combination);
                    continue;
                }
                let cluster = match report.resolve_cluster_name(&combination.tags) {
                    Some(cluster) => cluster,
                    None => {
                        warn!(group = %key, "no cluster matches group, costs left as billed");
                        stats.unprocessed_groups += 1;
                        dropped.insert(key);
                        continue;
                    }
                };
                let scope = (product, key.usage_type.clone(), cluster.clone());
                if let Some(owner) = claimed.get(&scope) {
                    error!(
                        cluster = %cluster,
                        group = %key,
                        owner = %owner,
                        "cluster already claimed by another tag group, dropping group"
                    );
                    stats.conflicts += 1;
                    dropped.insert(key);
                    continue;
                }
                debug!(group = %key, cluster = %cluster, "resolved billed group");
                claimed.insert(scope, key.clone());
                cluster_by_key.insert(key.clone(), cluster);
                groups.insert(key, vec![combination]);
            }
        }
        stats.groups = groups.len();

        let mut hours: Vec<HashMap<AllocationKey, Vec<AllocationEntry>>> = Vec::new();
        for (key, cluster) in &cluster_by_key {
            for hour in 0..=MAX_MONTH_HOURS {
                let entries = self.hour_entries(report, key, cluster, hour);
                if entries.is_empty() {
                    continue;
                }
                stats.entries += entries.len();
                while hours.len() <= hour {
                    hours.push(HashMap::new());
                }
                hours[hour].insert(key.clone(), entries);
            }
        }

        let claimed_clusters: HashSet<&str> =
            cluster_by_key.values().map(String::as_str).collect();
        stats.unprocessed_clusters = report
            .clusters()
            .filter(|c| !claimed_clusters.contains(c))
            .map(String::from)
            .collect();
        stats.unprocessed_clusters.sort();
        for cluster in &stats.unprocessed_clusters {
            warn!(report_cluster = %cluster, "cluster has utilization data but no billed group");
        }
        info!(
            report = %self.config.name,
            groups = stats.groups,
            entries = stats.entries,
            conflicts = stats.conflicts,
            unprocessed_groups = stats.unprocessed_groups,
            unprocessed_clusters = stats.unprocessed_clusters.len(),
            "built allocation report"
        );

        Ok(AllocationReport {
            hours,
            groups,
            output_indices: self.output_indices()?,
            stats,
        })
    }

    /// Fractional entries for one cluster hour. Namespace rollup rows
    /// and zero factors never produce entries; when the accepted
    /// fractions leave more than the threshold unaccounted, a synthetic
    /// remainder entry carries the difference (which can be negative
    /// when reports over-report usage).
    fn hour_entries(
        &self,
        report: &UtilizationReport,
        key: &AllocationKey,
        cluster: &str,
        hour: usize,
    ) -> Vec<AllocationEntry> {
        let mut entries = Vec::new();
        let mut factor_sum = 0.0;
        for record in report.records(cluster, hour) {
            if record.kind == WorkloadKind::Namespace {
                continue;
            }
            if let Some(usage_type) = &key.usage_type {
                if &record.usage_type != usage_type {
                    continue;
                }
            }
            let fraction = report.allocation_factor(key.product, record);
            if fraction == 0.0 {
                continue;
            }
            factor_sum += fraction;
            entries.push(AllocationEntry {
                fraction,
                outputs: self.entry_outputs(record),
            });
        }
        if entries.is_empty() {
            return entries;
        }
        let remainder = 1.0 - factor_sum;
        if remainder.abs() > REMAINDER_THRESHOLD {
            entries.push(AllocationEntry {
                fraction: remainder,
                outputs: self.unused_outputs(),
            });
        }
        entries
    }
}

impl AllocationReport {
    pub fn is_empty(&self) -> bool {
        self.hours.iter().all(HashMap::is_empty)
    }

    pub fn hours(&self) -> usize {
        self.hours.len()
    }

    pub fn entries(&self, hour: usize, key: &AllocationKey) -> &[AllocationEntry] {
        self.hours
            .get(hour)
            .and_then(|h| h.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn keys(&self, hour: usize) -> impl Iterator<Item = &AllocationKey> {
        self.hours.get(hour).into_iter().flat_map(HashMap::keys)
    }

    /// Member combination with an entry's non-empty output values laid
    /// over the configured destination tags
    fn destination(&self, member: &TagCombination, outputs: &[String]) -> TagCombination {
        let mut tags = member.tags.clone();
        for (&index, value) in self.output_indices.iter().zip(outputs) {
            if !value.is_empty() {
                tags[index] = value.clone();
            }
        }
        TagCombination::new(member.product, member.usage_type.clone(), tags)
    }

    /// Compute the dataset mutations this report implies, against the
    /// dataset as a snapshot. Pure; the dataset is not modified.
    pub fn compute_delta(&self, dataset: &dyn CostDataset) -> AllocationDelta {
        let mut delta = AllocationDelta::default();
        for (hour, keys) in self.hours.iter().enumerate() {
            for (key, entries) in keys {
                let members = match self.groups.get(key) {
                    Some(members) => members,
                    None => continue,
                };
                for member in members {
                    let total = dataset.get(hour, member);
                    if total == 0.0 {
                        continue;
                    }
                    let mut allocated = 0.0;
                    // Entries sharing a destination accumulate before
                    // the delta is recorded
                    let mut destinations: Vec<(TagCombination, f64)> = Vec::new();
                    for entry in entries {
                        let amount = total * entry.fraction;
                        if amount == 0.0 {
                            continue;
                        }
                        allocated += amount;
                        let dest = self.destination(member, &entry.outputs);
                        match destinations.iter_mut().find(|(d, _)| *d == dest) {
                            Some((_, sum)) => *sum += amount,
                            None => destinations.push((dest, amount)),
                        }
                    }
                    if destinations.is_empty() {
                        continue;
                    }
                    let residual = total - allocated;
                    if residual.abs() < REMAINDER_THRESHOLD {
                        delta.removes.push((hour, member.clone()));
                    } else {
                        delta.overwrites.push((hour, member.clone(), residual));
                    }
                    for (dest, amount) in destinations {
                        delta.inserts.push((hour, dest, amount));
                    }
                }
            }
        }
        delta
    }

    /// Compute and merge the delta in one step.
    ///
    /// Run at most once per dataset for a given report; the delta is
    /// relative to the dataset's current contents.
    pub fn apply(&self, dataset: &mut dyn CostDataset) -> ApplyStats {
        let delta = self.compute_delta(dataset);
        let stats = delta.apply_to(dataset);
        info!(
            inserted = stats.inserted,
            rewritten = stats.rewritten,
            removed = stats.removed,
            "applied allocation report"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_month, OutputTagsConfig};
    use crate::dataset::InMemoryCostDataset;
    use std::path::PathBuf;

    const HEADER: &str = "Cluster,Type,Resource,Namespace,StartDate,EndDate,\
RequestsCPUCores,UsedCPUCores,LimitsCPUCores,ClusterCPUCores,\
RequestsMemoryGiB,UsedMemoryGiB,LimitsMemoryGiB,ClusterMemoryGiB,\
NetworkInGiB,ClusterNetworkInGiB,NetworkOutGiB,ClusterNetworkOutGiB,\
PersistentVolumeClaimGiB,ClusterPersistentVolumeClaimGiB";

    fn tag_keys() -> Vec<String> {
        ["Cluster", "K8sNamespace", "K8sType", "K8sResource"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn test_config() -> AllocationConfig {
        AllocationConfig {
            name: "k8s".to_string(),
            start: "2019-01".to_string(),
            end: "2022-11".to_string(),
            report_dir: PathBuf::from("/reports"),
            report_prefix: "kubernetes-".to_string(),
            cluster_name_formulae: vec!["Cluster".to_string()],
            out: OutputTagsConfig {
                namespace: "K8sNamespace".to_string(),
                kind: Some("K8sType".to_string()),
                resource: Some("K8sResource".to_string()),
            },
            copy_tags: Vec::new(),
            namespace_mappings: Vec::new(),
        }
    }

    fn load_report(rows: &[&str]) -> UtilizationReport {
        let mut report = UtilizationReport::new(
            &test_config(),
            &tag_keys(),
            parse_month("2019-01").unwrap(),
        )
        .unwrap();
        let csv = format!("{}\n{}", HEADER, rows.join("\n"));
        report.read_from("test", csv.as_bytes()).unwrap();
        report
    }

    fn billed(cluster: &str) -> TagCombination {
        TagCombination::new(
            Product::ComputeInstance,
            "BoxUsage",
            vec![
                cluster.to_string(),
                String::new(),
                String::new(),
                String::new(),
            ],
        )
    }

    // Rows split the 100-core / 910-GiB cluster (denominator 2000) at
    // hour 0: web takes 600 units, batch 400, leaving half unused.
    const SPLIT_ROWS: &[&str] = &[
        "c1,Pod,web-1,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,50,0,0,100,55,0,0,910,0,0,0,0,0,0",
        "c1,Deployment,batch,jobs,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,30,0,0,100,73,0,0,910,0,0,0,0,0,0",
    ];

    #[test]
    fn test_build_splits_hour_with_remainder_entry() {
        let report = load_report(SPLIT_ROWS);
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        assert_eq!(allocation.stats.groups, 1);

        let key = AllocationKey {
            product: Product::ComputeInstance,
            usage_type: None,
            tags: vec!["c1".to_string()],
        };
        let entries = allocation.entries(0, &key);
        assert_eq!(entries.len(), 3);
        assert!((entries[0].fraction - 0.3).abs() < 1e-12);
        assert!((entries[1].fraction - 0.2).abs() < 1e-12);
        assert!((entries[2].fraction - 0.5).abs() < 1e-12);
        assert_eq!(entries[0].outputs, ["Pod", "web-1", "apps"]);
        assert_eq!(entries[2].outputs, [UNUSED, UNUSED, UNUSED]);
        let total: f64 = entries.iter().map(|e| e.fraction).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_apply_redistributes_and_removes_original() {
        let report = load_report(SPLIT_ROWS);
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        allocation.apply(&mut dataset);

        let web = TagCombination::new(
            Product::ComputeInstance,
            "BoxUsage",
            vec![
                "c1".to_string(),
                "apps".to_string(),
                "Pod".to_string(),
                "web-1".to_string(),
            ],
        );
        let unused = TagCombination::new(
            Product::ComputeInstance,
            "BoxUsage",
            vec![
                "c1".to_string(),
                UNUSED.to_string(),
                UNUSED.to_string(),
                UNUSED.to_string(),
            ],
        );
        assert!((dataset.get(0, &web) - 30.0).abs() < 1e-9);
        assert!((dataset.get(0, &unused) - 50.0).abs() < 1e-9);
        assert_eq!(dataset.get(0, &billed("c1")), 0.0);
        assert!((dataset.total() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_namespace_rollup_rows_produce_no_entries() {
        let report = load_report(&[
            "c1,Namespace,apps,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,80,0,0,100,128,0,0,910,0,0,0,0,0,0",
            "c1,Pod,web-1,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,50,0,0,100,55,0,0,910,0,0,0,0,0,0",
        ]);
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        let key = AllocationKey {
            product: Product::ComputeInstance,
            usage_type: None,
            tags: vec!["c1".to_string()],
        };
        // Only the Pod row and the remainder; the rollup never appears
        let entries = allocation.entries(0, &key);
        assert_eq!(entries.len(), 2);
        assert!((entries[0].fraction - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_unmatched_group_and_cluster_are_reported() {
        let report = load_report(SPLIT_ROWS);
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("elsewhere"), 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        assert_eq!(allocation.stats.groups, 0);
        assert_eq!(allocation.stats.unprocessed_groups, 1);
        assert_eq!(allocation.stats.unprocessed_clusters, ["c1"]);
        assert!(allocation.is_empty());

        // Nothing to allocate, nothing changes
        allocation.apply(&mut dataset);
        assert!((dataset.get(0, &billed("elsewhere")) - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_cluster_resolution_drops_later_group() {
        let config = AllocationConfig {
            cluster_name_formulae: vec![
                "Cluster".to_string(),
                "Cluster.regex(\"k8s-(.*)\")".to_string(),
            ],
            ..test_config()
        };
        let mut report =
            UtilizationReport::new(&config, &tag_keys(), parse_month("2019-01").unwrap()).unwrap();
        let csv = format!("{}\n{}", HEADER, SPLIT_ROWS.join("\n"));
        report.read_from("test", csv.as_bytes()).unwrap();

        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);
        dataset.put(0, &billed("k8s-c1"), 60.0);

        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        assert_eq!(allocation.stats.groups, 1);
        assert_eq!(allocation.stats.conflicts, 1);

        // The dropped group's cost is untouched by apply
        allocation.apply(&mut dataset);
        assert!((dataset.get(0, &billed("k8s-c1")) - 60.0).abs() < 1e-12);
        assert_eq!(dataset.get(0, &billed("c1")), 0.0);
    }

    #[test]
    fn test_distinct_products_on_one_cluster_are_not_a_conflict() {
        // One workload holding half the cluster's PVC capacity and 30%
        // of its compute units
        let report = load_report(&[
            "c1,Pod,web-1,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,50,0,0,100,55,0,0,910,0,0,0,0,150,300",
        ]);
        let storage = TagCombination::new(
            Product::BlockStorage,
            "Storage",
            vec![
                "c1".to_string(),
                String::new(),
                String::new(),
                String::new(),
            ],
        );
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);
        dataset.put(0, &storage, 50.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        assert_eq!(allocation.stats.conflicts, 0);
        assert_eq!(allocation.stats.groups, 2);

        allocation.apply(&mut dataset);

        let compute_web = TagCombination::new(
            Product::ComputeInstance,
            "BoxUsage",
            vec![
                "c1".to_string(),
                "apps".to_string(),
                "Pod".to_string(),
                "web-1".to_string(),
            ],
        );
        let storage_web = TagCombination::new(
            Product::BlockStorage,
            "Storage",
            vec![
                "c1".to_string(),
                "apps".to_string(),
                "Pod".to_string(),
                "web-1".to_string(),
            ],
        );
        assert!((dataset.get(0, &compute_web) - 30.0).abs() < 1e-9);
        assert!((dataset.get(0, &storage_web) - 25.0).abs() < 1e-9);
        // Both originals fully redistributed
        assert_eq!(dataset.get(0, &billed("c1")), 0.0);
        assert_eq!(dataset.get(0, &storage), 0.0);
        assert!((dataset.total() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_distinct_usage_types_on_one_cluster_are_not_a_conflict() {
        let csv = format!(
            "{},UsageType\n\
c1,Pod,web-1,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,50,0,0,100,55,0,0,910,0,0,0,0,0,0,BoxUsage\n\
c1,Deployment,batch,jobs,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,30,0,0,100,73,0,0,910,0,0,0,0,0,0,SpotUsage",
            HEADER
        );
        let mut report = UtilizationReport::new(
            &test_config(),
            &tag_keys(),
            parse_month("2019-01").unwrap(),
        )
        .unwrap();
        report.read_from("test", csv.as_bytes()).unwrap();

        let spot = TagCombination::new(
            Product::ComputeInstance,
            "SpotUsage",
            vec![
                "c1".to_string(),
                String::new(),
                String::new(),
                String::new(),
            ],
        );
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 40.0);
        dataset.put(0, &spot, 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        assert_eq!(allocation.stats.conflicts, 0);
        assert_eq!(allocation.stats.groups, 2);

        allocation.apply(&mut dataset);

        // Each usage type only sees its own rows: 0.3 of $40, 0.2 of $100
        let box_web = TagCombination::new(
            Product::ComputeInstance,
            "BoxUsage",
            vec![
                "c1".to_string(),
                "apps".to_string(),
                "Pod".to_string(),
                "web-1".to_string(),
            ],
        );
        let spot_batch = TagCombination::new(
            Product::ComputeInstance,
            "SpotUsage",
            vec![
                "c1".to_string(),
                "jobs".to_string(),
                "Deployment".to_string(),
                "batch".to_string(),
            ],
        );
        assert!((dataset.get(0, &box_web) - 12.0).abs() < 1e-9);
        assert!((dataset.get(0, &spot_batch) - 20.0).abs() < 1e-9);
        assert!((dataset.total() - 140.0).abs() < 1e-9);
    }

    #[test]
    fn test_large_residual_rewrites_original_in_place() {
        // Factor sum is 0.99995, inside the remainder threshold, so no
        // synthetic entry is built; the unallocated $0.005 stays on the
        // original item.
        let report = load_report(&[
            "c1,Pod,web-1,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,100,0,0,100,909.9,0,0,910,0,0,0,0,0,0",
        ]);
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        let key = AllocationKey {
            product: Product::ComputeInstance,
            usage_type: None,
            tags: vec!["c1".to_string()],
        };
        assert_eq!(allocation.entries(0, &key).len(), 1);

        allocation.apply(&mut dataset);
        let residual = dataset.get(0, &billed("c1"));
        assert!(residual > 0.0 && residual < 0.01, "residual {}", residual);
        assert!((dataset.total() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_over_allocation_passes_through_negative_remainder() {
        // 150 of 100 cores requested: factor 1.5, remainder entry -0.5
        let report = load_report(&[
            "c1,Pod,web-1,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,150,0,0,100,1365,0,0,910,0,0,0,0,0,0",
        ]);
        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        allocation.apply(&mut dataset);

        let unused = TagCombination::new(
            Product::ComputeInstance,
            "BoxUsage",
            vec![
                "c1".to_string(),
                UNUSED.to_string(),
                UNUSED.to_string(),
                UNUSED.to_string(),
            ],
        );
        assert!((dataset.get(0, &unused) + 50.0).abs() < 1e-9);
        assert!((dataset.total() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_usage_type_dimension_splits_groups() {
        let header_with_usage = format!("{},UsageType", HEADER);
        let csv = format!(
            "{}\nc1,Pod,web-1,apps,2019-01-01T00:00:00Z,2019-01-01T01:00:00Z,50,0,0,100,55,0,0,910,0,0,0,0,0,0,BoxUsage",
            header_with_usage
        );
        let mut report = UtilizationReport::new(
            &test_config(),
            &tag_keys(),
            parse_month("2019-01").unwrap(),
        )
        .unwrap();
        report.read_from("test", csv.as_bytes()).unwrap();
        assert!(report.has_usage_type());

        let mut dataset = InMemoryCostDataset::new(1);
        dataset.put(0, &billed("c1"), 100.0);

        let config = test_config();
        let keys = tag_keys();
        let engine = AllocationEngine::new(&config, &keys).unwrap();
        let allocation = engine.build(&report, &dataset).unwrap();
        let key = AllocationKey {
            product: Product::ComputeInstance,
            usage_type: Some("BoxUsage".to_string()),
            tags: vec!["c1".to_string()],
        };
        assert_eq!(allocation.entries(0, &key).len(), 2);
        // Rows with a different usage type never feed this group
        let other = AllocationKey {
            usage_type: Some("SpotUsage".to_string()),
            ..key
        };
        assert!(allocation.entries(0, &other).is_empty());
    }
}
