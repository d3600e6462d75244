// ABOUTME: Folds decoded stream events into closed source transactions
// ABOUTME: Emits transactions in commit-marker order and bounds per-transaction buffering

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use super::decoder::{ChangeEvent, Marker, MarkerKind, StreamEvent};
use super::record::{Offset, Position, ResumeOffsets, TxId};
use crate::error::ReplicationError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatcherConfig {
    /// Upper bound on buffered rows for a single open transaction.
    pub max_transaction_rows: usize,
    /// Upper bound for an initial snapshot; `None` buffers snapshots of any size.
    pub max_snapshot_rows: Option<usize>,
    /// Commit markers of transactions without rows are dropped.
    pub skip_empty_transactions: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_transaction_rows: 100_000,
            max_snapshot_rows: None,
            skip_empty_transactions: true,
        }
    }
}

/// A closed source transaction. Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    id: TxId,
    partition: u32,
    begin_position: Position,
    commit_position: Position,
    resume_offset: Offset,
    events: Vec<ChangeEvent>,
    is_snapshot: bool,
}

impl Transaction {
    pub fn id(&self) -> &TxId {
        &self.id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn begin_position(&self) -> Position {
        self.begin_position
    }

    pub fn commit_position(&self) -> Position {
        self.commit_position
    }

    /// Offset a session must restart from on this partition so that no
    /// transaction still open when this one committed is lost.
    pub fn resume_offset(&self) -> Offset {
        self.resume_offset
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }
}

#[derive(Debug)]
struct OpenTransaction {
    id: TxId,
    begin: Position,
    events: Vec<ChangeEvent>,
}

impl OpenTransaction {
    fn new(marker: &Marker) -> Self {
        Self {
            id: marker.tx_id.clone(),
            begin: marker.position,
            events: Vec::new(),
        }
    }
}

/// Reassembles transactions from a possibly interleaved, multi-partition
/// stream of rows and boundary markers.
#[derive(Debug)]
pub struct TransactionBatcher {
    config: BatcherConfig,
    open: HashMap<(u32, TxId), OpenTransaction>,
    snapshots: HashMap<u32, OpenTransaction>,
    applied: ResumeOffsets,
}

impl TransactionBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        Self::resuming(config, BTreeMap::new())
    }

    /// A batcher that drops transactions whose commit offset is at or below
    /// `applied` for their partition; they are already reflected in the target.
    pub fn resuming(config: BatcherConfig, applied: ResumeOffsets) -> Self {
        Self {
            config,
            open: HashMap::new(),
            snapshots: HashMap::new(),
            applied,
        }
    }

    pub fn open_transactions(&self) -> usize {
        self.open.len() + self.snapshots.len()
    }

    pub fn buffered_rows(&self) -> usize {
        self.open.values().map(|t| t.events.len()).sum::<usize>()
            + self.snapshots.values().map(|t| t.events.len()).sum::<usize>()
    }

    /// Fold one event in. Returns the transaction it closed, if any.
    pub fn push(&mut self, event: StreamEvent) -> Result<Option<Transaction>, ReplicationError> {
        match event {
            StreamEvent::Row(row) => {
                self.push_row(row)?;
                Ok(None)
            }
            StreamEvent::Marker(marker) => Ok(self.push_marker(marker)),
        }
    }

    /// Lazily turn an event sequence into closed transactions.
    pub fn transactions<I>(&mut self, events: I) -> Transactions<'_, I::IntoIter>
    where
        I: IntoIterator<Item = StreamEvent>,
    {
        Transactions {
            batcher: self,
            events: events.into_iter(),
        }
    }

    fn push_row(&mut self, mut row: ChangeEvent) -> Result<(), ReplicationError> {
        let partition = row.position.partition;

        let (buffer, key, limit) = if let Some(snapshot) = self.snapshots.get_mut(&partition) {
            (snapshot, None, self.config.max_snapshot_rows)
        } else {
            let key = (partition, row.tx_id.clone());
            match self.open.get_mut(&key) {
                Some(open) => (open, Some(key), Some(self.config.max_transaction_rows)),
                None => {
                    tracing::debug!(
                        "Dropping {} at {} for transaction {} that began before the resume point",
                        row.operation().as_str(),
                        row.position,
                        row.tx_id
                    );
                    return Ok(());
                }
            }
        };

        if let Some(limit) = limit.filter(|limit| buffer.events.len() >= *limit) {
            let tx_id = buffer.id.to_string();
            match key {
                Some(key) => {
                    self.open.remove(&key);
                }
                None => {
                    self.snapshots.remove(&partition);
                }
            }
            return Err(ReplicationError::OversizedTransaction { tx_id, limit });
        }

        row.sequence = buffer.events.len() as u64;
        buffer.events.push(row);
        Ok(())
    }

    fn push_marker(&mut self, marker: Marker) -> Option<Transaction> {
        let partition = marker.position.partition;
        let in_snapshot = self.snapshots.contains_key(&partition);

        match marker.kind {
            MarkerKind::BeginSnapshot => {
                if let Some(previous) = self.snapshots.insert(partition, OpenTransaction::new(&marker)) {
                    tracing::warn!(
                        "Snapshot {} on partition {} restarted at {} with {} rows buffered",
                        previous.id,
                        partition,
                        marker.position,
                        previous.events.len()
                    );
                }
                None
            }
            MarkerKind::CommitSnapshot => {
                let snapshot = self.snapshots.remove(&partition)?;
                self.close(snapshot, &marker, true)
            }
            _ if in_snapshot => None,
            MarkerKind::BeginTransaction => {
                self.open
                    .insert((partition, marker.tx_id.clone()), OpenTransaction::new(&marker));
                None
            }
            MarkerKind::CommitTransaction => {
                match self.open.remove(&(partition, marker.tx_id.clone())) {
                    Some(open) => self.close(open, &marker, false),
                    None => {
                        tracing::debug!(
                            "Skipping commit of partial transaction {} at {}",
                            marker.tx_id,
                            marker.position
                        );
                        None
                    }
                }
            }
            MarkerKind::RollbackTransaction => {
                if let Some(open) = self.open.remove(&(partition, marker.tx_id.clone())) {
                    tracing::debug!(
                        "Discarding {} rows of rolled back transaction {}",
                        open.events.len(),
                        open.id
                    );
                }
                None
            }
        }
    }

    fn close(&mut self, open: OpenTransaction, commit: &Marker, is_snapshot: bool) -> Option<Transaction> {
        let partition = commit.position.partition;

        if let Some(applied) = self.applied.get(&partition) {
            if commit.position.offset <= *applied {
                tracing::debug!(
                    "Skipping transaction {} committed at {}, already applied",
                    open.id,
                    commit.position
                );
                return None;
            }
        }

        if open.events.is_empty() && self.config.skip_empty_transactions {
            return None;
        }

        let resume_offset = self
            .open
            .iter()
            .filter(|((p, _), _)| *p == partition)
            .map(|(_, t)| t.begin.offset)
            .min()
            .unwrap_or(commit.position.offset);

        self.applied.insert(partition, commit.position.offset);

        Some(Transaction {
            id: open.id,
            partition,
            begin_position: open.begin,
            commit_position: commit.position,
            resume_offset,
            events: open.events,
            is_snapshot,
        })
    }
}

pub struct Transactions<'a, I> {
    batcher: &'a mut TransactionBatcher,
    events: I,
}

impl<I> Iterator for Transactions<'_, I>
where
    I: Iterator<Item = StreamEvent>,
{
    type Item = Result<Transaction, ReplicationError>;

    fn next(&mut self) -> Option<Self::Item> {
        for event in self.events.by_ref() {
            match self.batcher.push(event) {
                Ok(Some(tx)) => return Some(Ok(tx)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
