//! Output tag overlay for allocated entries
//!
//! Each allocated line item may carry additional billing tags beyond
//! the workload identity columns: values copied straight out of report
//! columns, and values derived from namespace-pattern rules. Copied
//! values always win over derived ones.

use anyhow::Result;
use regex::Regex;

use crate::config::AllocationConfig;
use crate::models::UtilizationRecord;

/// One namespace-pattern rule, compiled
struct NamespaceRule {
    key: String,
    value: String,
    patterns: Vec<Regex>,
}

impl NamespaceRule {
    fn matches(&self, namespace: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(namespace))
    }
}

/// Computes the overlay tag values for one utilization row
pub struct OutputTagger {
    /// Destination keys, copy keys first, then rule keys not already
    /// covered by a copy
    keys: Vec<String>,
    copy_count: usize,
    /// Rules grouped per destination key, aligned to `keys[copy_count..]`,
    /// plus for copy keys the rules acting as fallback when the copied
    /// cell is empty
    rules_by_key: Vec<Vec<NamespaceRule>>,
}

impl OutputTagger {
    pub fn new(config: &AllocationConfig) -> Result<Self> {
        let mut keys: Vec<String> = config.copy_tags.iter().map(|c| c.key.clone()).collect();
        let copy_count = keys.len();
        for mapping in &config.namespace_mappings {
            if !keys.contains(&mapping.tag) {
                keys.push(mapping.tag.clone());
            }
        }

        let mut rules_by_key: Vec<Vec<NamespaceRule>> = keys.iter().map(|_| Vec::new()).collect();
        for mapping in &config.namespace_mappings {
            let mut patterns = Vec::new();
            for pattern in &mapping.patterns {
                if pattern.is_empty() {
                    continue;
                }
                // Patterns match the whole namespace, never a substring
                patterns.push(Regex::new(&format!("^(?:{})$", pattern))?);
            }
            let slot = keys.iter().position(|k| k == &mapping.tag).unwrap_or(0);
            rules_by_key[slot].push(NamespaceRule {
                key: mapping.tag.clone(),
                value: mapping.value.clone(),
                patterns,
            });
        }

        Ok(Self {
            keys,
            copy_count,
            rules_by_key,
        })
    }

    /// Destination tag keys, in stable output order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Overlay values for one row, aligned to `keys()`. A copied column
    /// value wins; an empty copy falls back to the first namespace rule
    /// whose pattern matches; no match leaves the value empty.
    pub fn values(&self, record: &UtilizationRecord) -> Vec<String> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                if i < self.copy_count {
                    let copied = record.output_tags.get(i).map(String::as_str).unwrap_or("");
                    if !copied.is_empty() {
                        return copied.to_string();
                    }
                }
                self.rules_by_key[i]
                    .iter()
                    .find(|rule| rule.key == *key && rule.matches(&record.namespace))
                    .map(|rule| rule.value.clone())
                    .unwrap_or_default()
            })
            .collect()
    }
}
