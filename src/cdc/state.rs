// ABOUTME: CheckpointStore - durable record of the last applied source position
// ABOUTME: JSON state file shared by all pipelines, or a state table in the target database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use super::record::{Offset, Position, ResumeOffsets};
use crate::error::ReplicationError;
use crate::utils::{quote_ident, sanitize_url};

/// Progress of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Commit position of the last applied transaction.
    pub position: Position,
    /// Last applied commit offset per partition.
    pub offsets: ResumeOffsets,
    /// Offset a new capture session starts from, per partition.
    pub resume: ResumeOffsets,
    #[serde(default)]
    pub transactions_applied: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The checkpoint after applying the transaction committed at `position`.
    /// Offsets never move backwards within a partition.
    pub fn advance(
        previous: Option<&Checkpoint>,
        position: &Position,
        resume_from: &Offset,
    ) -> Result<Checkpoint, ReplicationError> {
        let (mut offsets, mut resume, applied) = match previous {
            Some(prev) => (prev.offsets.clone(), prev.resume.clone(), prev.transactions_applied),
            None => (ResumeOffsets::new(), ResumeOffsets::new(), 0),
        };

        if let Some(current) = offsets.get(&position.partition) {
            if position.offset < *current {
                return Err(ReplicationError::CheckpointRegression {
                    partition: position.partition,
                    current: current.to_hex(),
                    requested: position.offset.to_hex(),
                });
            }
        }

        offsets.insert(position.partition, position.offset);
        resume.insert(position.partition, *resume_from);
        Ok(Checkpoint {
            position: *position,
            offsets,
            resume,
            transactions_applied: applied + 1,
            updated_at: Utc::now(),
        })
    }
}

#[async_trait]
pub trait CheckpointStore: Send {
    async fn load(&mut self) -> Result<Option<Checkpoint>, ReplicationError>;

    /// Durably record that the transaction committed at `position` is applied.
    /// Returns the checkpoint as stored.
    async fn save(
        &mut self,
        position: &Position,
        resume_from: &Offset,
    ) -> Result<Checkpoint, ReplicationError>;
}

#[async_trait]
impl CheckpointStore for Box<dyn CheckpointStore> {
    async fn load(&mut self) -> Result<Option<Checkpoint>, ReplicationError> {
        (**self).load().await
    }

    async fn save(
        &mut self,
        position: &Position,
        resume_from: &Offset,
    ) -> Result<Checkpoint, ReplicationError> {
        (**self).save(position, resume_from).await
    }
}

/// Checkpoint entry for one (source table, target table) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    /// Source database URL (sanitized - no password)
    pub source_url: String,
    pub source_table: String,
    pub target_table: String,
    pub checkpoint: Checkpoint,
}

/// Contents of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Version of the state format for future migrations
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by [`pipeline_key`]
    pub pipelines: BTreeMap<String, PipelineCheckpoint>,
}

impl CheckpointFile {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            created_at: now,
            updated_at: now,
            pipelines: BTreeMap::new(),
        }
    }

    pub fn get(&self, source_table: &str, target_table: &str) -> Option<&PipelineCheckpoint> {
        self.pipelines.get(&pipeline_key(source_table, target_table))
    }
}

impl Default for CheckpointFile {
    fn default() -> Self {
        Self::new()
    }
}

pub fn pipeline_key(source_table: &str, target_table: &str) -> String {
    format!("{} -> {}", source_table, target_table)
}

fn io_error(path: &Path, action: &str, err: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::CheckpointIo(format!("failed to {} {}: {}", action, path.display(), err))
}

/// A state file plus the lock that serialises read-modify-write cycles of
/// the pipelines sharing it.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default state file path for the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".cdc-replicator/checkpoints.json")
    }

    pub fn store_for(&self, source_url: &str, source_table: &str, target_table: &str) -> FileCheckpointStore {
        FileCheckpointStore {
            file: self.clone(),
            source_url: sanitize_url(source_url),
            source_table: source_table.to_string(),
            target_table: target_table.to_string(),
        }
    }

    /// Read the whole file; a missing file is an empty state.
    pub async fn read(&self) -> Result<CheckpointFile, ReplicationError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CheckpointFile::new()),
            Err(e) => return Err(io_error(&self.path, "read", e)),
        };
        serde_json::from_str(&contents).map_err(|e| {
            ReplicationError::CheckpointCorrupt(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }

    /// Replace the file atomically: write a sibling, fsync, rename over.
    async fn write(&self, state: &CheckpointFile) -> Result<(), ReplicationError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, "create directory", e))?;
        }

        let contents =
            serde_json::to_vec_pretty(state).map_err(|e| io_error(&self.path, "serialize", e))?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| io_error(&tmp, "create", e))?;
        file.write_all(&contents)
            .await
            .map_err(|e| io_error(&tmp, "write", e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, "sync", e))?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, "replace", e))
    }
}

/// One pipeline's view of a [`StateFile`].
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    file: StateFile,
    source_url: String,
    source_table: String,
    target_table: String,
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&mut self) -> Result<Option<Checkpoint>, ReplicationError> {
        let _guard = self.file.lock.lock().await;
        let state = self.file.read().await?;
        Ok(state
            .get(&self.source_table, &self.target_table)
            .map(|entry| entry.checkpoint.clone()))
    }

    async fn save(
        &mut self,
        position: &Position,
        resume_from: &Offset,
    ) -> Result<Checkpoint, ReplicationError> {
        let _guard = self.file.lock.lock().await;
        let mut state = self.file.read().await?;
        let key = pipeline_key(&self.source_table, &self.target_table);

        let previous = state.pipelines.get(&key).map(|entry| &entry.checkpoint);
        let checkpoint = Checkpoint::advance(previous, position, resume_from)?;

        state.pipelines.insert(
            key,
            PipelineCheckpoint {
                source_url: self.source_url.clone(),
                source_table: self.source_table.clone(),
                target_table: self.target_table.clone(),
                checkpoint: checkpoint.clone(),
            },
        );
        state.updated_at = checkpoint.updated_at;
        self.file.write(&state).await?;
        Ok(checkpoint)
    }
}

pub const CHECKPOINT_TABLE: &str = "cdc_replicator_checkpoints";

/// Checkpoints kept in a table of the target database.
pub struct PostgresCheckpointStore {
    url: String,
    schema: String,
    client: Option<Client>,
    source_table: String,
    target_table: String,
}

impl PostgresCheckpointStore {
    pub fn new(url: &str, schema: &str, source_table: &str, target_table: &str) -> Self {
        Self {
            url: url.to_string(),
            schema: schema.to_string(),
            client: None,
            source_table: source_table.to_string(),
            target_table: target_table.to_string(),
        }
    }

    fn table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(CHECKPOINT_TABLE))
    }

    async fn connected(&mut self) -> Result<&mut Client, ReplicationError> {
        if self.client.as_ref().map_or(true, |c| c.is_closed()) {
            self.client = None;
            let client = crate::postgres::open(&self.url).await?;
            client
                .batch_execute(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        source_table TEXT NOT NULL,
                        target_table TEXT NOT NULL,
                        checkpoint JSONB NOT NULL,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                        PRIMARY KEY (source_table, target_table)
                    )",
                    self.table()
                ))
                .await?;
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| ReplicationError::Connection("checkpoint store is not connected".to_string()))
    }
}

fn decode_checkpoint(value: serde_json::Value) -> Result<Checkpoint, ReplicationError> {
    serde_json::from_value(value)
        .map_err(|e| ReplicationError::CheckpointCorrupt(format!("stored checkpoint row: {}", e)))
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&mut self) -> Result<Option<Checkpoint>, ReplicationError> {
        let query = format!(
            "SELECT checkpoint FROM {} WHERE source_table = $1 AND target_table = $2",
            self.table()
        );
        let source_table = self.source_table.clone();
        let target_table = self.target_table.clone();
        let client = self.connected().await?;
        let row = client
            .query_opt(&query, &[&source_table, &target_table])
            .await?;
        row.map(|row| decode_checkpoint(row.get(0))).transpose()
    }

    async fn save(
        &mut self,
        position: &Position,
        resume_from: &Offset,
    ) -> Result<Checkpoint, ReplicationError> {
        let select = format!(
            "SELECT checkpoint FROM {} WHERE source_table = $1 AND target_table = $2 FOR UPDATE",
            self.table()
        );
        let upsert = format!(
            "INSERT INTO {} (source_table, target_table, checkpoint, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (source_table, target_table)
             DO UPDATE SET checkpoint = EXCLUDED.checkpoint, updated_at = EXCLUDED.updated_at",
            self.table()
        );
        let source_table = self.source_table.clone();
        let target_table = self.target_table.clone();

        let client = self.connected().await?;
        let tx = client.transaction().await?;
        let previous = tx
            .query_opt(&select, &[&source_table, &target_table])
            .await?
            .map(|row| decode_checkpoint(row.get(0)))
            .transpose()?;
        let checkpoint = Checkpoint::advance(previous.as_ref(), position, resume_from)?;
        let value = serde_json::to_value(&checkpoint)
            .map_err(|e| ReplicationError::CheckpointIo(e.to_string()))?;
        tx.execute(&upsert, &[&source_table, &target_table, &value])
            .await?;
        tx.commit().await?;
        Ok(checkpoint)
    }
}
