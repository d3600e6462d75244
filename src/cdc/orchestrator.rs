// ABOUTME: Orchestrator - drives read, batch, apply and checkpoint for one pipeline
// ABOUTME: Owns the retry-or-halt decision and honours shutdown between transactions

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::applier::TargetApplier;
use super::batcher::{BatcherConfig, Transaction, TransactionBatcher};
use super::decoder::ChangeEventDecoder;
use super::reader::{spawn_reader, CaptureSource, ChangeStreamReader, ReaderConfig};
use super::record::{Offset, Position, RawRecord, ResumeOffsets};
use super::state::{Checkpoint, CheckpointStore};
use super::writer::TargetWriter;
use crate::error::{ErrorClass, ReplicationError};
use crate::shutdown::ShutdownSignal;
use crate::utils::RetryPolicy;

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Name used in log lines, usually "source -> target".
    pub name: String,
    pub reader: ReaderConfig,
    pub batcher: BatcherConfig,
    /// Retry budget for transient failures of apply, checkpoint and reader.
    pub retry: RetryPolicy,
    /// Upper bound for one apply or checkpoint call
    pub apply_timeout: Duration,
    /// Upper bound for applying an initial snapshot
    pub snapshot_apply_timeout: Duration,
    /// Capacity of the queue between the reader task and the apply chain
    pub queue_capacity: usize,
    /// Log progress every N applied transactions (0 disables)
    pub progress_every: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Reading,
    Applying,
    Checkpointing,
    Halted(ErrorClass),
    Stopped,
}

/// Statistics from a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub transactions_applied: u64,
    pub rows_applied: u64,
    pub retries: u64,
    pub reader_restarts: u64,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    /// Shutdown was requested and honoured at a transaction boundary.
    Stopped {
        checkpoint: Option<Checkpoint>,
        stats: PipelineStats,
    },
    /// A fatal error, or a transient one that outlived the retry budget.
    Halted {
        class: ErrorClass,
        error: ReplicationError,
        checkpoint: Option<Checkpoint>,
        stats: PipelineStats,
    },
}

impl PipelineOutcome {
    pub fn state(&self) -> PipelineState {
        match self {
            PipelineOutcome::Stopped { .. } => PipelineState::Stopped,
            PipelineOutcome::Halted { class, .. } => PipelineState::Halted(*class),
        }
    }

    /// Last durable checkpoint.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            PipelineOutcome::Stopped { checkpoint, .. } | PipelineOutcome::Halted { checkpoint, .. } => {
                checkpoint.as_ref()
            }
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        match self {
            PipelineOutcome::Stopped { stats, .. } | PipelineOutcome::Halted { stats, .. } => stats,
        }
    }

    pub fn error(&self) -> Option<&ReplicationError> {
        match self {
            PipelineOutcome::Halted { error, .. } => Some(error),
            PipelineOutcome::Stopped { .. } => None,
        }
    }

    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self.state() {
            PipelineState::Halted(ErrorClass::Transient) => 2,
            PipelineState::Halted(ErrorClass::Structural) => 3,
            PipelineState::Halted(ErrorClass::Consistency) => 4,
            _ => 0,
        }
    }
}

/// Aborts the reader task when the session it serves is abandoned.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type RecordQueue = mpsc::Receiver<Result<RawRecord, ReplicationError>>;

pub struct Orchestrator<S, W, C>
where
    S: CaptureSource + Clone + 'static,
    W: TargetWriter,
    C: CheckpointStore,
{
    settings: PipelineSettings,
    source: S,
    decoder: ChangeEventDecoder,
    applier: TargetApplier<W>,
    store: C,
    state: PipelineState,
    checkpoint: Option<Checkpoint>,
    stats: PipelineStats,
}

impl<S, W, C> Orchestrator<S, W, C>
where
    S: CaptureSource + Clone + 'static,
    W: TargetWriter,
    C: CheckpointStore,
{
    pub fn new(
        settings: PipelineSettings,
        source: S,
        decoder: ChangeEventDecoder,
        applier: TargetApplier<W>,
        store: C,
    ) -> Self {
        Self {
            settings,
            source,
            decoder,
            applier,
            store,
            state: PipelineState::Idle,
            checkpoint: None,
            stats: PipelineStats::default(),
        }
    }

    /// Replicate until shutdown or a halting error.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> PipelineOutcome {
        tracing::info!("Starting pipeline {}", self.settings.name);

        match self.load_checkpoint().await {
            Ok(checkpoint) => self.checkpoint = checkpoint,
            Err(e) => return self.halt(e),
        }
        match &self.checkpoint {
            Some(cp) => tracing::info!(
                "Pipeline {} resuming after {} ({} transactions applied so far)",
                self.settings.name,
                cp.position,
                cp.transactions_applied
            ),
            None => tracing::info!("Pipeline {} has no checkpoint, starting with a snapshot", self.settings.name),
        }

        let mut failures = 0u32;
        'session: loop {
            let (resume, applied) = match &self.checkpoint {
                Some(cp) => (cp.resume.clone(), cp.offsets.clone()),
                None => (ResumeOffsets::new(), ResumeOffsets::new()),
            };
            let reader = ChangeStreamReader::new(
                self.source.clone(),
                self.settings.reader.clone(),
                resume,
                shutdown.clone(),
            );
            let (mut queue, handle) = spawn_reader(reader, self.settings.queue_capacity);
            let _reader_task = ReaderTask(handle);
            let mut batcher = TransactionBatcher::resuming(self.settings.batcher.clone(), applied);

            loop {
                self.state = PipelineState::Reading;
                let tx = match self.next_transaction(&mut queue, &mut batcher, &mut shutdown).await {
                    Ok(Some(tx)) => tx,
                    Ok(None) => return self.stop(),
                    Err(e) if e.is_transient() => {
                        failures += 1;
                        if !self.settings.retry.allows(failures) {
                            return self.halt(e);
                        }
                        self.stats.reader_restarts += 1;
                        let delay = self.settings.retry.delay_for(failures);
                        tracing::warn!(
                            "Pipeline {} lost the change stream (attempt {}/{}), restarting from the last checkpoint in {:?}: {}",
                            self.settings.name,
                            failures,
                            self.settings.retry.max_attempts + 1,
                            delay,
                            e
                        );
                        tokio::select! {
                            _ = shutdown.requested() => return self.stop(),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue 'session;
                    }
                    Err(e) => return self.halt(e),
                };

                // Only boundary at which shutdown is honoured with a transaction in hand.
                if shutdown.is_requested() {
                    tracing::debug!("Dropping unapplied transaction {} on shutdown", tx.id());
                    return self.stop();
                }

                self.state = PipelineState::Applying;
                let position = match self.apply(&tx).await {
                    Ok(position) => position,
                    Err(e) => return self.halt(e),
                };

                self.state = PipelineState::Checkpointing;
                if let Err(e) = self.save_checkpoint(&position, &tx.resume_offset()).await {
                    return self.halt(e);
                }

                failures = 0;
                self.stats.transactions_applied += 1;
                self.stats.rows_applied += tx.len() as u64;
                self.log_progress();
            }
        }
    }

    async fn next_transaction(
        &mut self,
        queue: &mut RecordQueue,
        batcher: &mut TransactionBatcher,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<Transaction>, ReplicationError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.requested() => return Ok(None),
                item = queue.recv() => item,
            };
            let raw = match item {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Err(e),
                None if shutdown.is_requested() => return Ok(None),
                None => {
                    return Err(ReplicationError::Connection(
                        "change stream reader stopped unexpectedly".to_string(),
                    ))
                }
            };
            let event = self.decoder.decode(&raw)?;
            if let Some(tx) = batcher.push(event)? {
                return Ok(Some(tx));
            }
        }
    }

    async fn load_checkpoint(&mut self) -> Result<Option<Checkpoint>, ReplicationError> {
        let timeout = self.settings.apply_timeout;
        let mut attempt = 0u32;
        loop {
            let err = match tokio::time::timeout(timeout, self.store.load()).await {
                Ok(Ok(checkpoint)) => return Ok(checkpoint),
                Ok(Err(e)) => e,
                Err(_) => ReplicationError::Timeout {
                    operation: "loading the checkpoint",
                    timeout,
                },
            };
            self.backoff(&mut attempt, err).await?;
        }
    }

    /// Apply `tx`, retrying the same transaction on transient failures.
    async fn apply(&mut self, tx: &Transaction) -> Result<Position, ReplicationError> {
        let timeout = if tx.is_snapshot() {
            self.settings.snapshot_apply_timeout
        } else {
            self.settings.apply_timeout
        };
        let mut attempt = 0u32;
        loop {
            let err = match tokio::time::timeout(timeout, self.applier.apply(tx)).await {
                Ok(Ok(position)) => return Ok(position),
                Ok(Err(e)) => e,
                Err(_) => {
                    match tokio::time::timeout(timeout, self.applier.abort()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("Rollback after timeout failed: {}", e),
                        Err(_) => tracing::warn!("Rollback after timeout timed out"),
                    }
                    ReplicationError::Timeout {
                        operation: "applying a transaction",
                        timeout,
                    }
                }
            };
            self.backoff(&mut attempt, err).await?;
        }
    }

    async fn save_checkpoint(&mut self, position: &Position, resume_from: &Offset) -> Result<(), ReplicationError> {
        let timeout = self.settings.apply_timeout;
        let mut attempt = 0u32;
        loop {
            let err = match tokio::time::timeout(timeout, self.store.save(position, resume_from)).await {
                Ok(Ok(checkpoint)) => {
                    self.checkpoint = Some(checkpoint);
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => ReplicationError::Timeout {
                    operation: "saving the checkpoint",
                    timeout,
                },
            };
            self.backoff(&mut attempt, err).await?;
        }
    }

    /// Sleep before the next attempt, or hand `err` back when it is fatal or
    /// the budget is spent.
    async fn backoff(&mut self, attempt: &mut u32, err: ReplicationError) -> Result<(), ReplicationError> {
        if !err.is_transient() {
            return Err(err);
        }
        *attempt += 1;
        if !self.settings.retry.allows(*attempt) {
            return Err(err);
        }
        self.stats.retries += 1;
        let delay = self.settings.retry.delay_for(*attempt);
        tracing::warn!(
            "Pipeline {} {:?} failed (attempt {}/{}), retrying in {:?}: {}",
            self.settings.name,
            self.state,
            attempt,
            self.settings.retry.max_attempts + 1,
            delay,
            err
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn log_progress(&self) {
        let every = self.settings.progress_every;
        if every == 0 || self.stats.transactions_applied % every != 0 {
            return;
        }
        if let Some(cp) = &self.checkpoint {
            tracing::info!(
                "Pipeline {}: {} transactions, {} rows applied; checkpoint at {}",
                self.settings.name,
                self.stats.transactions_applied,
                self.stats.rows_applied,
                cp.position
            );
        }
    }

    fn stop(self) -> PipelineOutcome {
        tracing::info!(
            "Pipeline {} stopped after {} transactions ({} rows)",
            self.settings.name,
            self.stats.transactions_applied,
            self.stats.rows_applied
        );
        PipelineOutcome::Stopped {
            checkpoint: self.checkpoint,
            stats: self.stats,
        }
    }

    fn halt(self, error: ReplicationError) -> PipelineOutcome {
        let class = error.class();
        let position = self
            .checkpoint
            .as_ref()
            .map(|cp| cp.position.to_string())
            .unwrap_or_else(|| "none".to_string());
        tracing::error!(
            "Pipeline {} halted in state {:?} with {} error {}: {} (last durable checkpoint: {})",
            self.settings.name,
            self.state,
            class,
            error.kind(),
            error,
            position
        );
        PipelineOutcome::Halted {
            class,
            error,
            checkpoint: self.checkpoint,
            stats: self.stats,
        }
    }
}
