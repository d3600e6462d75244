// ABOUTME: In-memory doubles for the capture source, target table and checkpoint store
// ABOUTME: Shared by the pipeline and checkpoint integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cdc_replicator::cdc::decoder::{ChangeEventDecoder, ColumnValues};
use cdc_replicator::cdc::orchestrator::PipelineSettings;
use cdc_replicator::cdc::reader::{CaptureSession, CaptureSource, ReaderConfig};
use cdc_replicator::cdc::record::{Offset, Position, RawRecord, RecordHeader, ResumeOffsets, TxId};
use cdc_replicator::cdc::state::{Checkpoint, CheckpointStore};
use cdc_replicator::cdc::batcher::BatcherConfig;
use cdc_replicator::cdc::types::{TypeMap, Value};
use cdc_replicator::cdc::writer::TargetWriter;
use cdc_replicator::error::ReplicationError;
use cdc_replicator::table::TableDefinition;
use cdc_replicator::utils::RetryPolicy;
use mysql_async::Value as RawValue;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TARGET_TABLE: &str = "public.x_table_replicated";

/// `x_table (id BIGINT PRIMARY KEY, val TEXT NULL)`
pub fn table() -> TableDefinition {
    TableDefinition::new("x_table")
        .column("id", "bigint", false, true)
        .column("val", "text", true, false)
}

pub fn decoder() -> ChangeEventDecoder {
    ChangeEventDecoder::new(&table(), &TypeMap::default())
}

pub fn key_columns() -> Vec<String> {
    vec!["id".to_string()]
}

/// Retry policy without delays so tests do not sleep.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        jitter: 0.0,
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        name: "x_db.x_table -> public.x_table_replicated".to_string(),
        reader: ReaderConfig {
            expected_columns: table().column_names(),
            read_timeout: Duration::from_secs(30),
            reconnect: fast_retry(3),
        },
        batcher: BatcherConfig::default(),
        retry: fast_retry(3),
        apply_timeout: Duration::from_secs(5),
        snapshot_apply_timeout: Duration::from_secs(5),
        queue_capacity: 4,
        progress_every: 0,
    }
}

/// Builds change records with increasing offsets.
#[derive(Debug, Default)]
pub struct StreamBuilder {
    next_offset: u64,
    records: Vec<RawRecord>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next record will get.
    pub fn next_offset(&self) -> Offset {
        Offset::from_sequence(self.next_offset + 1)
    }

    /// Append an arbitrary record.
    pub fn record(&mut self, partition: u32, record_type: &str, tx: &str, values: Vec<RawValue>) -> Position {
        self.next_offset += 1;
        let offset = Offset::from_sequence(self.next_offset);
        self.records.push(RawRecord {
            header: RecordHeader {
                offset,
                partition_id: partition,
                record_type: record_type.to_string(),
                table: "x_table".to_string(),
                tx_id: TxId::from(tx),
                tx_partitions: 1,
                internal_id: Some(self.next_offset as i64),
            },
            values,
        });
        Position { partition, offset }
    }

    fn row(id: i64, val: Option<&str>) -> Vec<RawValue> {
        vec![
            RawValue::Int(id),
            match val {
                Some(val) => RawValue::Bytes(val.as_bytes().to_vec()),
                None => RawValue::NULL,
            },
        ]
    }

    fn marker_values() -> Vec<RawValue> {
        vec![RawValue::NULL, RawValue::NULL]
    }

    pub fn begin(&mut self, partition: u32, tx: &str) -> Position {
        self.record(partition, "BeginTransaction", tx, Self::marker_values())
    }

    pub fn commit(&mut self, partition: u32, tx: &str) -> Position {
        self.record(partition, "CommitTransaction", tx, Self::marker_values())
    }

    pub fn rollback(&mut self, partition: u32, tx: &str) -> Position {
        self.record(partition, "RollbackTransaction", tx, Self::marker_values())
    }

    pub fn begin_snapshot(&mut self, partition: u32) -> Position {
        self.record(partition, "BeginSnapshot", "", Self::marker_values())
    }

    pub fn commit_snapshot(&mut self, partition: u32) -> Position {
        self.record(partition, "CommitSnapshot", "", Self::marker_values())
    }

    pub fn insert(&mut self, partition: u32, tx: &str, id: i64, val: &str) -> Position {
        self.record(partition, "Insert", tx, Self::row(id, Some(val)))
    }

    pub fn update(&mut self, partition: u32, tx: &str, id: i64, val: &str) -> Position {
        self.record(partition, "Update", tx, Self::row(id, Some(val)))
    }

    pub fn delete(&mut self, partition: u32, tx: &str, id: i64, val: &str) -> Position {
        self.record(partition, "Delete", tx, Self::row(id, Some(val)))
    }

    /// A whole single-partition transaction of inserts. Returns its commit position.
    pub fn insert_tx(&mut self, partition: u32, tx: &str, rows: &[(i64, &str)]) -> Position {
        self.begin(partition, tx);
        for (id, val) in rows {
            self.insert(partition, tx, *id, val);
        }
        self.commit(partition, tx)
    }

    /// Hand over the records built since the last call.
    pub fn take(&mut self) -> Vec<RawRecord> {
        std::mem::take(&mut self.records)
    }
}

#[derive(Default)]
struct SourceState {
    log: Vec<RawRecord>,
    columns: Vec<String>,
    opens: Vec<ResumeOffsets>,
    failing_opens: u32,
    failing_reads: u32,
    /// Fail reads once this many records were handed out in total.
    fail_after: Option<usize>,
    served: usize,
}

/// A capture source replaying an append-only record log.
///
/// A session opened at offsets delivers every record at or above its
/// partition's offset (all records when opened without offsets), then waits
/// for more to be appended.
#[derive(Clone)]
pub struct ScriptedSource {
    state: Arc<Mutex<SourceState>>,
    appended: Arc<Notify>,
}

impl ScriptedSource {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                columns,
                ..Default::default()
            })),
            appended: Arc::new(Notify::new()),
        }
    }

    pub fn for_table() -> Self {
        Self::new(table().column_names())
    }

    pub fn append(&self, records: Vec<RawRecord>) {
        self.state.lock().unwrap().log.extend(records);
        self.appended.notify_waiters();
    }

    /// Offsets every session was opened with, in order.
    pub fn opens(&self) -> Vec<ResumeOffsets> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn fail_opens(&self, count: u32) {
        self.state.lock().unwrap().failing_opens = count;
    }

    /// Make the next `count` reads fail with a lost connection.
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().unwrap().failing_reads = count;
        self.appended.notify_waiters();
    }

    /// Drop the connection once `served` records were delivered in total,
    /// `count` times in a row.
    pub fn fail_reads_after(&self, served: usize, count: u32) {
        let mut state = self.state.lock().unwrap();
        state.fail_after = Some(served);
        state.failing_reads = count;
    }

    pub fn served(&self) -> usize {
        self.state.lock().unwrap().served
    }
}

#[async_trait]
impl CaptureSource for ScriptedSource {
    type Session = ScriptedSession;

    async fn open(&mut self, resume: &ResumeOffsets) -> Result<ScriptedSession, ReplicationError> {
        let mut state = self.state.lock().unwrap();
        state.opens.push(resume.clone());
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(ReplicationError::Connection("source refused connection".to_string()));
        }
        Ok(ScriptedSession {
            state: self.state.clone(),
            appended: self.appended.clone(),
            columns: state.columns.clone(),
            resume: resume.clone(),
            cursor: 0,
        })
    }
}

pub struct ScriptedSession {
    state: Arc<Mutex<SourceState>>,
    appended: Arc<Notify>,
    columns: Vec<String>,
    resume: ResumeOffsets,
    cursor: usize,
}

impl ScriptedSession {
    fn poll(&mut self) -> Option<Result<RawRecord, ReplicationError>> {
        let mut state = self.state.lock().unwrap();
        let armed = state.fail_after.map_or(true, |after| state.served >= after);
        if armed && state.failing_reads > 0 {
            state.failing_reads -= 1;
            if state.failing_reads == 0 {
                state.fail_after = None;
            }
            return Some(Err(ReplicationError::Connection("connection reset by peer".to_string())));
        }
        while self.cursor < state.log.len() {
            let record = state.log[self.cursor].clone();
            self.cursor += 1;
            let visible = match self.resume.get(&record.header.partition_id) {
                Some(offset) => record.header.offset >= *offset,
                None => true,
            };
            if visible {
                state.served += 1;
                return Some(Ok(record));
            }
        }
        None
    }
}

#[async_trait]
impl CaptureSession for ScriptedSession {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>, ReplicationError> {
        let notify = self.appended.clone();
        loop {
            let appended = notify.notified();
            if let Some(result) = self.poll() {
                return result.map(Some);
            }
            appended.await;
        }
    }
}

/// How a target statement should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Connection lost: retried by the orchestrator
    Transient,
    /// Statement rejected: halts the pipeline
    Structural,
}

impl Failure {
    fn error(self) -> ReplicationError {
        match self {
            Failure::Transient => ReplicationError::Connection("target connection lost".to_string()),
            Failure::Structural => ReplicationError::Target("value too long for column".to_string()),
        }
    }
}

/// How a stalled statement waits.
#[derive(Clone)]
pub enum Stall {
    /// Never returns; only a timeout gets past it
    Forever,
    /// Returns once the gate is notified
    Until(Arc<Notify>),
}

pub type Rows = BTreeMap<i64, ColumnValues>;

#[derive(Default)]
struct TargetState {
    committed: Rows,
    staged: Option<Rows>,
    /// Row count of every committed transaction, in commit order
    commits: Vec<usize>,
    statements_in_tx: usize,
    rollbacks: usize,
    /// Statement number (1-based, across all statements) to fail at
    fail_at_statement: VecDeque<(usize, Failure)>,
    statements: usize,
    failing_commits: u32,
    /// Statement number (1-based, across all statements) to hold before running
    stall_at_statement: VecDeque<(usize, Stall)>,
    stalled: usize,
}

/// In-memory mirror table keyed by `id`, with begin/commit/rollback semantics.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<TargetState>>,
}

fn key_of(row: &ColumnValues) -> Result<i64, ReplicationError> {
    match row.get("id") {
        Some(Value::Int(id)) => Ok(*id),
        other => Err(ReplicationError::Target(format!("row without id: {:?}", other))),
    }
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load committed rows.
    pub fn seed(&self, rows: &[(i64, &str)]) {
        let mut state = self.state.lock().unwrap();
        for (id, val) in rows {
            state.committed.insert(*id, row(*id, val));
        }
    }

    pub fn rows(&self) -> Rows {
        self.state.lock().unwrap().committed.clone()
    }

    /// `(id, val)` pairs of the committed table.
    pub fn contents(&self) -> Vec<(i64, String)> {
        self.rows()
            .iter()
            .map(|(id, row)| {
                let val = match row.get("val") {
                    Some(Value::Text(val)) => val.clone(),
                    _ => String::new(),
                };
                (*id, val)
            })
            .collect()
    }

    pub fn commits(&self) -> Vec<usize> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().staged.is_some()
    }

    /// Fail statement number `statement` (counted from now, 1-based).
    pub fn fail_statement(&self, statement: usize, failure: Failure) {
        let mut state = self.state.lock().unwrap();
        let at = state.statements + statement;
        state.fail_at_statement.push_back((at, failure));
    }

    pub fn fail_commits(&self, count: u32) {
        self.state.lock().unwrap().failing_commits = count;
    }

    /// Hold statement number `statement` (counted from now, 1-based) before it runs.
    pub fn stall_statement(&self, statement: usize, stall: Stall) {
        let mut state = self.state.lock().unwrap();
        let at = state.statements + statement;
        state.stall_at_statement.push_back((at, stall));
    }

    /// Number of statements that have reached a stall.
    pub fn stalled(&self) -> usize {
        self.state.lock().unwrap().stalled
    }

    async fn stall_point(&self) {
        let stall = {
            let mut state = self.state.lock().unwrap();
            let next = state.statements + 1;
            match state.stall_at_statement.iter().position(|(at, _)| *at == next) {
                Some(index) => {
                    state.stalled += 1;
                    state.stall_at_statement.remove(index).map(|(_, stall)| stall)
                }
                None => None,
            }
        };
        match stall {
            Some(Stall::Forever) => std::future::pending::<()>().await,
            Some(Stall::Until(gate)) => gate.notified().await,
            None => {}
        }
    }

    fn statement<T>(
        &self,
        op: impl FnOnce(&mut Rows) -> Result<T, ReplicationError>,
    ) -> Result<T, ReplicationError> {
        let mut state = self.state.lock().unwrap();
        state.statements += 1;
        let current = state.statements;
        if let Some(index) = state.fail_at_statement.iter().position(|(at, _)| *at == current) {
            if let Some((_, failure)) = state.fail_at_statement.remove(index) {
                return Err(failure.error());
            }
        }
        state.statements_in_tx += 1;
        match state.staged.as_mut() {
            Some(rows) => op(rows),
            None => Err(ReplicationError::Target("statement outside a transaction".to_string())),
        }
    }
}

pub fn row(id: i64, val: &str) -> ColumnValues {
    let mut row = ColumnValues::new();
    row.insert("id".to_string(), Value::Int(id));
    row.insert("val".to_string(), Value::Text(val.to_string()));
    row
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn begin(&mut self) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().unwrap();
        state.staged = Some(state.committed.clone());
        state.statements_in_tx = 0;
        Ok(())
    }

    async fn upsert(&mut self, row: &ColumnValues) -> Result<(), ReplicationError> {
        let id = key_of(row)?;
        self.stall_point().await;
        self.statement(|rows| {
            rows.insert(id, row.clone());
            Ok(())
        })
    }

    async fn update(&mut self, key: &ColumnValues, row: &ColumnValues) -> Result<u64, ReplicationError> {
        let id = key_of(key)?;
        self.stall_point().await;
        self.statement(|rows| match rows.get_mut(&id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(1)
            }
            None => Ok(0),
        })
    }

    async fn delete(&mut self, key: &ColumnValues) -> Result<u64, ReplicationError> {
        let id = key_of(key)?;
        self.stall_point().await;
        self.statement(|rows| Ok(rows.remove(&id).map_or(0, |_| 1)))
    }

    async fn commit(&mut self) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(Failure::Transient.error());
        }
        let staged = state
            .staged
            .take()
            .ok_or_else(|| ReplicationError::Target("commit outside a transaction".to_string()))?;
        state.committed = staged;
        let count = state.statements_in_tx;
        state.commits.push(count);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().unwrap();
        if state.staged.take().is_some() {
            state.rollbacks += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    checkpoint: Option<Checkpoint>,
    saves: usize,
    failing_saves: u32,
}

/// Checkpoint store held in memory; clones share state so a restarted
/// pipeline sees what the previous run saved.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.state.lock().unwrap().checkpoint.clone()
    }

    pub fn saves(&self) -> usize {
        self.state.lock().unwrap().saves
    }

    pub fn fail_saves(&self, count: u32) {
        self.state.lock().unwrap().failing_saves = count;
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&mut self) -> Result<Option<Checkpoint>, ReplicationError> {
        Ok(self.checkpoint())
    }

    async fn save(&mut self, position: &Position, resume_from: &Offset) -> Result<Checkpoint, ReplicationError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_saves > 0 {
            state.failing_saves -= 1;
            return Err(ReplicationError::CheckpointIo("disk full".to_string()));
        }
        let checkpoint = Checkpoint::advance(state.checkpoint.as_ref(), position, resume_from)?;
        state.checkpoint = Some(checkpoint.clone());
        state.saves += 1;
        Ok(checkpoint)
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
