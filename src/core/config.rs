//! Run configuration loaded from `rekey.toml`, plus schema description files.
//!
//! CLI flags are applied on top of the file by the binary; every field has a
//! default so an empty file (or no file) is valid.

use crate::core::error::{RekeyError, Result};
use crate::engine::graph::TableDescriptor;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How referential violations found while cascading are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationMode {
    /// Abort the scope on the first orphaned reference.
    #[default]
    Strict,
    /// Record orphans in the run and keep going.
    Lenient,
}

/// Transaction granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeMode {
    /// One transaction around the whole plan.
    Single,
    /// One transaction per table (and one for deferred edges).
    #[default]
    PerTable,
    /// One transaction per batch.
    PerBatch,
}

impl ScopeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeMode::Single => "single",
            ScopeMode::PerTable => "per-table",
            ScopeMode::PerBatch => "per-batch",
        }
    }
}

impl ViolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationMode::Strict => "strict",
            ViolationMode::Lenient => "lenient",
        }
    }
}

/// What lenient mode does with an orphan in a NOT NULL column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotNullOrphanPolicy {
    Fail,
    Keep,
    Sentinel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrphanConfig {
    /// Deliberately has no default.
    pub not_null_policy: Option<NotNullOrphanPolicy>,
    pub sentinel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingConfig {
    pub cache_entries: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            cache_entries: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    /// Referencing tables up to this many rows are scanned exhaustively.
    pub exhaustive_limit: u64,
    /// Values sampled per edge above the limit.
    pub sample_size: u64,
    /// Offending values kept per edge in the report.
    pub max_reported: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            exhaustive_limit: 1_000_000,
            sample_size: 10_000,
            max_reported: 20,
        }
    }
}

/// A foreign key an operator asked to apply after all tables are rekeyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeferredEdgeConfig {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RekeyConfig {
    /// Schema description file (TOML or JSON); relative to the config file.
    pub schema: Option<PathBuf>,
    /// Inline schema description.
    pub tables: Vec<TableDescriptor>,
    pub batch_size: usize,
    pub mode: ViolationMode,
    pub scope: ScopeMode,
    /// Last table (inclusive) processed by this invocation.
    pub until: Option<String>,
    pub workers: usize,
    pub scope_timeout_secs: u64,
    pub retry_budget: u32,
    pub busy_timeout_secs: u64,
    /// Regex every legacy primary key must match.
    pub legacy_pattern: Option<String>,
    pub max_clock_drift_ms: u64,
    pub deferred_edges: Vec<DeferredEdgeConfig>,
    pub audit_log: Option<PathBuf>,
    pub mapping: MappingConfig,
    pub verify: VerifyConfig,
    pub orphans: OrphanConfig,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            schema: None,
            tables: Vec::new(),
            batch_size: 500,
            mode: ViolationMode::Strict,
            scope: ScopeMode::PerTable,
            until: None,
            workers: default_workers(),
            scope_timeout_secs: 600,
            retry_budget: 3,
            busy_timeout_secs: 5,
            legacy_pattern: None,
            max_clock_drift_ms: 10_000,
            deferred_edges: Vec::new(),
            audit_log: None,
            mapping: MappingConfig::default(),
            verify: VerifyConfig::default(),
            orphans: OrphanConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

impl RekeyConfig {
    /// Load from a TOML file, resolving `schema` relative to the file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RekeyError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: RekeyConfig = toml::from_str(&content)?;
        if let (Some(schema), Some(base)) = (config.schema.as_ref(), path.parent()) {
            if schema.is_relative() {
                config.schema = Some(base.join(schema));
            }
        }
        Ok(config)
    }

    /// Load the file when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RekeyError::ConfigError("batch_size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(RekeyError::ConfigError("workers must be at least 1".into()));
        }
        if self.retry_budget == 0 {
            return Err(RekeyError::ConfigError("retry_budget must be at least 1".into()));
        }
        if self.mapping.cache_entries == 0 {
            return Err(RekeyError::ConfigError(
                "mapping.cache_entries must be at least 1".into(),
            ));
        }
        if self.scope_timeout_secs == 0 {
            return Err(RekeyError::ConfigError(
                "scope_timeout_secs must be at least 1".into(),
            ));
        }
        if let Some(pattern) = &self.legacy_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                RekeyError::ConfigError(format!("legacy_pattern is not a valid regex: {}", e))
            })?;
        }
        if self.orphans.not_null_policy == Some(NotNullOrphanPolicy::Sentinel)
            && self.orphans.sentinel.as_deref().unwrap_or("").is_empty()
        {
            return Err(RekeyError::ConfigError(
                "orphans.not_null_policy = \"sentinel\" requires orphans.sentinel".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the table descriptors: the schema file wins over inline tables.
    pub fn descriptors(&self) -> Result<Vec<TableDescriptor>> {
        match &self.schema {
            Some(path) => load_schema(path),
            None => Ok(self.tables.clone()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaFile {
    Wrapped { tables: Vec<TableDescriptor> },
    Bare(Vec<TableDescriptor>),
}

/// Load a schema description; `.json` files are JSON, everything else TOML.
pub fn load_schema(path: &Path) -> Result<Vec<TableDescriptor>> {
    let content = fs::read_to_string(path).map_err(|e| {
        RekeyError::ConfigError(format!("cannot read schema {}: {}", path.display(), e))
    })?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        let parsed: SchemaFile = serde_json::from_str(&content)?;
        Ok(match parsed {
            SchemaFile::Wrapped { tables } => tables,
            SchemaFile::Bare(tables) => tables,
        })
    } else {
        #[derive(Deserialize)]
        struct TomlSchema {
            #[serde(default)]
            tables: Vec<TableDescriptor>,
        }
        let parsed: TomlSchema = toml::from_str(&content)?;
        Ok(parsed.tables)
    }
}
