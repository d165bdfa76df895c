//! Allocation configuration
//!
//! Rule files describe one or more utilization-report sources: where the
//! monthly report lives, how cluster names derive from billed tag
//! values, and which destination tags allocation entries receive.
//! Everything is validated eagerly so a bad rule fails the run before
//! any report is read.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::formula::FormulaEvaluator;

/// Configuration errors surfaced at load time
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid formula \"{formula}\": {reason}")]
    InvalidFormula { formula: String, reason: String },

    #[error("unknown tag key \"{key}\" in {context}")]
    UnknownTagKey { key: String, context: String },

    #[error("invalid month \"{0}\", expected YYYY-MM")]
    InvalidMonth(String),

    #[error("invalid pattern \"{pattern}\" in namespace mapping for tag \"{tag}\": {reason}")]
    InvalidPattern {
        tag: String,
        pattern: String,
        reason: String,
    },

    #[error("rule \"{0}\" has no cluster name formulae")]
    NoFormulae(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Top-level processor configuration: the user-tag universe shared with
/// the cost dataset plus the configured report sources
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Ordered user-tag keys; every tag vector in the cost dataset is
    /// aligned to this list
    pub tag_keys: Vec<String>,
    #[serde(default)]
    pub reports: Vec<AllocationConfig>,
}

/// One utilization-report source and its allocation rules
#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    pub name: String,
    /// First month (inclusive) this source is active, YYYY-MM
    pub start: String,
    /// First month (exclusive) this source is no longer active, YYYY-MM
    pub end: String,
    /// Directory holding the monthly report files
    pub report_dir: PathBuf,
    /// Report file name prefix; the month and extension are appended
    #[serde(default = "default_report_prefix")]
    pub report_prefix: String,
    /// Ordered cluster-name formulas, tried in declaration order
    pub cluster_name_formulae: Vec<String>,
    /// Destination tag keys for the workload dimensions
    pub out: OutputTagsConfig,
    /// Tags copied verbatim from report passthrough columns
    #[serde(default)]
    pub copy_tags: Vec<CopyTagConfig>,
    /// Namespace-pattern rules filling destination tags the report
    /// does not carry
    #[serde(default)]
    pub namespace_mappings: Vec<NamespaceMapping>,
}

fn default_report_prefix() -> String {
    "kubernetes-".to_string()
}

/// Destination tag keys receiving the workload type, resource name and
/// namespace of each allocation entry
#[derive(Debug, Clone, Deserialize)]
pub struct OutputTagsConfig {
    pub namespace: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

/// One copy-tag: the destination tag key and the report column it is
/// copied from (defaults to the key itself)
#[derive(Debug, Clone, Deserialize)]
pub struct CopyTagConfig {
    pub key: String,
    #[serde(default)]
    pub column: Option<String>,
}

impl CopyTagConfig {
    pub fn column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.key)
    }
}

/// Binds a destination tag to a literal value for namespaces matching
/// any of the patterns (full-string regex match)
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceMapping {
    pub tag: String,
    pub value: String,
    pub patterns: Vec<String>,
}

impl ProcessorConfig {
    /// Load from a rule file (YAML or JSON) plus `ALLOCATOR_`-prefixed
    /// environment overrides
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("ALLOCATOR").separator("__"))
            .build()?;
        let parsed: ProcessorConfig = cfg.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate every rule: formulas compile, all referenced and
    /// destination tag keys exist, mapping patterns compile
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.reports {
            rule.validate(&self.tag_keys)?;
        }
        Ok(())
    }
}

impl AllocationConfig {
    pub fn validate(&self, tag_keys: &[String]) -> Result<(), ConfigError> {
        if self.cluster_name_formulae.is_empty() {
            return Err(ConfigError::NoFormulae(self.name.clone()));
        }
        // Compiling checks both syntax and tag references
        FormulaEvaluator::compile(&self.cluster_name_formulae, tag_keys)?;

        parse_month(&self.start)?;
        parse_month(&self.end)?;

        let known = |key: &str, context: &str| -> Result<(), ConfigError> {
            if tag_keys.iter().any(|k| k == key) {
                Ok(())
            } else {
                Err(ConfigError::UnknownTagKey {
                    key: key.to_string(),
                    context: context.to_string(),
                })
            }
        };

        known(&self.out.namespace, "out.namespace")?;
        if let Some(kind) = &self.out.kind {
            known(kind, "out.kind")?;
        }
        if let Some(resource) = &self.out.resource {
            known(resource, "out.resource")?;
        }
        for copy in &self.copy_tags {
            known(&copy.key, "copy_tags")?;
        }
        for mapping in &self.namespace_mappings {
            known(&mapping.tag, "namespace_mappings")?;
            for pattern in &mapping.patterns {
                if pattern.is_empty() {
                    continue;
                }
                Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                    tag: mapping.tag.clone(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Whether this source is active for the given month start
    pub fn is_active(&self, month: DateTime<Utc>) -> Result<bool, ConfigError> {
        let start = parse_month(&self.start)?;
        let end = parse_month(&self.end)?;
        Ok(start <= month && month < end)
    }

    /// Path of the report file for a month; the caller probes for the
    /// plain and gzipped variants
    pub fn report_path(&self, month: DateTime<Utc>) -> PathBuf {
        self.report_dir
            .join(format!("{}{}", self.report_prefix, month.format("%Y-%m")))
    }
}

/// Parse a YYYY-MM month label into its UTC start instant
pub fn parse_month(s: &str) -> Result<DateTime<Utc>, ConfigError> {
    let date = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidMonth(s.to_string()))?;
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ConfigError::InvalidMonth(s.to_string()))?;
    Ok(Utc.from_utc_datetime(&naive))
}
