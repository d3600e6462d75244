// ABOUTME: Replicator configuration loaded from TOML and overridden from the command line
// ABOUTME: Declares the table pairs to replicate plus retry, checkpoint and type-map settings

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cdc::batcher::BatcherConfig;
use crate::cdc::state::StateFile;
use crate::cdc::types::{TargetType, TypeMap};
use crate::table::{ColumnDefinition, TableDefinition};
use crate::utils::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// JSON state file on local disk
    #[default]
    File,
    /// State table in the target database
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    /// State file location for the file backend
    pub path: Option<PathBuf>,
    /// Target schema holding the checkpoint table for the postgres backend
    pub schema: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            path: None,
            schema: "public".to_string(),
        }
    }
}

impl CheckpointConfig {
    pub fn state_file_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(StateFile::default_path)
    }
}

/// Per-pipeline tuning, the `[pipelines.pipeline]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineTuning {
    /// Seconds without a record before the capture session is rotated
    pub read_timeout_secs: u64,
    /// Upper bound in seconds for one apply or checkpoint call
    pub apply_timeout_secs: u64,
    /// Upper bound in seconds for applying an initial snapshot
    pub snapshot_apply_timeout_secs: u64,
    /// Raw records buffered between the reader and the apply chain
    pub queue_capacity: usize,
    /// Log progress every N transactions (0 disables)
    pub progress_every: u64,
    pub max_transaction_rows: usize,
    /// Row ceiling for an initial snapshot (unset: no ceiling)
    pub max_snapshot_rows: Option<usize>,
    pub skip_empty_transactions: bool,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        let batcher = BatcherConfig::default();
        Self {
            read_timeout_secs: 300,
            apply_timeout_secs: 60,
            snapshot_apply_timeout_secs: 3600,
            queue_capacity: 1024,
            progress_every: 100,
            max_transaction_rows: batcher.max_transaction_rows,
            max_snapshot_rows: batcher.max_snapshot_rows,
            skip_empty_transactions: batcher.skip_empty_transactions,
        }
    }
}

impl PipelineTuning {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn snapshot_apply_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_apply_timeout_secs)
    }

    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            max_transaction_rows: self.max_transaction_rows,
            max_snapshot_rows: self.max_snapshot_rows,
            skip_empty_transactions: self.skip_empty_transactions,
        }
    }
}

/// One (source table, target table) pair.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub source_db: String,
    pub source_table: String,
    pub target_schema: String,
    pub target_table: String,
    /// Declared column set. When absent the source's information_schema is read.
    pub columns: Option<Vec<ColumnDefinition>>,
    /// Create the mirror table if it does not exist yet
    pub create_target_table: bool,
    pub pipeline: PipelineTuning,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_db: "x_db".to_string(),
            source_table: "x_table".to_string(),
            target_schema: "public".to_string(),
            target_table: "x_table_replicated".to_string(),
            columns: None,
            create_target_table: false,
            pipeline: PipelineTuning::default(),
        }
    }
}

impl PipelineConfig {
    /// Name used in logs and as the checkpoint key of the pair.
    pub fn name(&self) -> String {
        format!(
            "{}.{} -> {}.{}",
            self.source_db, self.source_table, self.target_schema, self.target_table
        )
    }

    pub fn source_key(&self) -> String {
        format!("{}.{}", self.source_db, self.source_table)
    }

    pub fn target_key(&self) -> String {
        format!("{}.{}", self.target_schema, self.target_table)
    }

    /// The declared table definition, if columns were configured.
    pub fn table_definition(&self) -> Option<TableDefinition> {
        self.columns.as_ref().map(|columns| TableDefinition {
            name: self.source_table.clone(),
            columns: columns.clone(),
        })
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("source_db", &self.source_db),
            ("source_table", &self.source_table),
            ("target_schema", &self.target_schema),
            ("target_table", &self.target_table),
        ] {
            if value.trim().is_empty() {
                bail!("Pipeline {}: {} must not be empty", self.name(), field);
            }
        }
        if let Some(table) = self.table_definition() {
            table
                .verify()
                .map_err(|e| anyhow::anyhow!("Pipeline {}: {}", self.name(), e))?;
        }
        let tuning = &self.pipeline;
        if tuning.read_timeout_secs == 0
            || tuning.apply_timeout_secs == 0
            || tuning.snapshot_apply_timeout_secs == 0
        {
            bail!("Pipeline {}: timeouts must be at least one second", self.name());
        }
        if tuning.queue_capacity == 0 {
            bail!("Pipeline {}: queue_capacity must be positive", self.name());
        }
        if tuning.max_transaction_rows == 0 || tuning.max_snapshot_rows == Some(0) {
            bail!("Pipeline {}: row limits must be positive", self.name());
        }
        Ok(())
    }
}

/// Command-line values that replace fields of the configured pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOverrides {
    pub source_db: Option<String>,
    pub source_table: Option<String>,
    pub target_schema: Option<String>,
    pub target_table: Option<String>,
    pub create_target_table: bool,
}

impl PipelineOverrides {
    fn is_empty(&self) -> bool {
        self.source_db.is_none()
            && self.source_table.is_none()
            && self.target_schema.is_none()
            && self.target_table.is_none()
            && !self.create_target_table
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicatorConfig {
    pub pipelines: Vec<PipelineConfig>,
    /// Source type name -> target type, layered over the built-in mapping
    pub type_map: BTreeMap<String, TargetType>,
    pub checkpoint: CheckpointConfig,
    /// Budget for transient apply, checkpoint and reader failures
    pub retry: RetryPolicy,
    /// Budget for reconnecting the capture session
    pub reconnect: RetryPolicy,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            pipelines: vec![PipelineConfig::default()],
            type_map: BTreeMap::new(),
            checkpoint: CheckpointConfig::default(),
            retry: RetryPolicy::default(),
            reconnect: RetryPolicy::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ReplicatorConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        Ok(config)
    }

    pub fn type_map(&self) -> TypeMap {
        TypeMap::with_overrides(&self.type_map)
    }

    /// Apply command-line overrides. They address a single pipeline, so a
    /// file declaring several is rejected when any override is set.
    pub fn apply_overrides(&mut self, overrides: PipelineOverrides) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        if self.pipelines.is_empty() {
            self.pipelines.push(PipelineConfig::default());
        }
        if self.pipelines.len() > 1 {
            bail!(
                "Table options on the command line need a configuration with exactly one pipeline (found {})",
                self.pipelines.len()
            );
        }

        let pipeline = &mut self.pipelines[0];
        if let Some(db) = overrides.source_db {
            pipeline.source_db = db;
        }
        if let Some(table) = overrides.source_table {
            pipeline.source_table = table;
        }
        if let Some(schema) = overrides.target_schema {
            pipeline.target_schema = schema;
        }
        if let Some(table) = overrides.target_table {
            pipeline.target_table = table;
        }
        pipeline.create_target_table |= overrides.create_target_table;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipelines.is_empty() {
            bail!("Configuration declares no pipelines");
        }

        let mut targets = HashSet::new();
        for pipeline in &self.pipelines {
            pipeline.validate()?;
            if !targets.insert(pipeline.target_key()) {
                bail!(
                    "Target table {} is written by more than one pipeline",
                    pipeline.target_key()
                );
            }
        }

        if self.retry.jitter < 0.0 || self.reconnect.jitter < 0.0 {
            bail!("Retry jitter must not be negative");
        }
        Ok(())
    }
}
