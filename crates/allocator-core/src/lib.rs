//! Core library for Kubernetes cost allocation
//!
//! This crate provides the core functionality for:
//! - Cluster-name formula evaluation against billing tags
//! - Utilization report parsing and hour indexing
//! - Output tag overlays (copied columns and namespace rules)
//! - Proportional allocation of billed costs across workloads

pub mod config;
pub mod dataset;
pub mod engine;
pub mod formula;
pub mod models;
pub mod report;
pub mod tagger;

pub use config::{AllocationConfig, ConfigError, ProcessorConfig};
pub use dataset::{CostDataset, InMemoryCostDataset};
pub use engine::{AllocationDelta, AllocationEngine, AllocationReport, ApplyStats, BuildStats};
pub use formula::FormulaEvaluator;
pub use models::*;
pub use report::{LoadStats, UtilizationReport};
pub use tagger::OutputTagger;
