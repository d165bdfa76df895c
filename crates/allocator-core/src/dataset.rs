//! Billed cost storage seam
//!
//! The allocation engine reads and rewrites hourly costs through this
//! trait so the billing backend stays swappable; the in-memory
//! implementation backs both the CSV snapshot workflow and the tests.

use std::collections::HashMap;

use crate::models::{Product, TagCombination};

/// Hourly billed costs keyed by tag combination
pub trait CostDataset {
    /// Number of hours covered; valid hour indices are `0..hours()`
    fn hours(&self) -> usize;

    /// Cost for one combination at one hour, 0.0 when absent
    fn get(&self, hour: usize, combination: &TagCombination) -> f64;

    /// Overwrite the cost for one combination at one hour
    fn put(&mut self, hour: usize, combination: &TagCombination, cost: f64);

    /// Drop the combination's line item for one hour
    fn remove(&mut self, hour: usize, combination: &TagCombination);

    /// All combinations billed under one product across any hour, in a
    /// stable order
    fn combinations(&self, product: Product) -> Vec<TagCombination>;
}

/// Hour-indexed cost maps held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryCostDataset {
    hours: Vec<HashMap<TagCombination, f64>>,
}

impl InMemoryCostDataset {
    pub fn new(hours: usize) -> Self {
        Self {
            hours: (0..hours).map(|_| HashMap::new()).collect(),
        }
    }

    /// Grow to cover `hour`, then set the cost
    pub fn insert(&mut self, hour: usize, combination: TagCombination, cost: f64) {
        while self.hours.len() <= hour {
            self.hours.push(HashMap::new());
        }
        self.hours[hour].insert(combination, cost);
    }

    /// Line items at one hour, unordered
    pub fn entries(&self, hour: usize) -> impl Iterator<Item = (&TagCombination, f64)> {
        self.hours
            .get(hour)
            .into_iter()
            .flat_map(|m| m.iter().map(|(k, &v)| (k, v)))
    }

    /// Sum of all costs across all hours
    pub fn total(&self) -> f64 {
        self.hours.iter().flat_map(|m| m.values()).sum()
    }
}

impl CostDataset for InMemoryCostDataset {
    fn hours(&self) -> usize {
        self.hours.len()
    }

    fn get(&self, hour: usize, combination: &TagCombination) -> f64 {
        self.hours
            .get(hour)
            .and_then(|m| m.get(combination))
            .copied()
            .unwrap_or(0.0)
    }

    fn put(&mut self, hour: usize, combination: &TagCombination, cost: f64) {
        self.insert(hour, combination.clone(), cost);
    }

    fn remove(&mut self, hour: usize, combination: &TagCombination) {
        if let Some(map) = self.hours.get_mut(hour) {
            map.remove(combination);
        }
    }

    fn combinations(&self, product: Product) -> Vec<TagCombination> {
        let mut seen: Vec<TagCombination> = Vec::new();
        for map in &self.hours {
            for combination in map.keys() {
                if combination.product == product && !seen.contains(combination) {
                    seen.push(combination.clone());
                }
            }
        }
        seen.sort_by(|a, b| {
            a.usage_type
                .cmp(&b.usage_type)
                .then_with(|| a.tags.cmp(&b.tags))
        });
        seen
    }
}
