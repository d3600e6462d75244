// ABOUTME: ChangeStreamReader - ordered raw records from a continuous capture session
// ABOUTME: Reconnects with bounded backoff and resumes at the last delivered offsets

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::record::{Offset, RawRecord, ResumeOffsets};
use crate::error::ReplicationError;
use crate::shutdown::ShutdownSignal;
use crate::utils::RetryPolicy;

/// Something that can open a capture session at a set of per-partition offsets.
///
/// Partitions missing from `resume` start from the source's default position.
#[async_trait]
pub trait CaptureSource: Send {
    type Session: CaptureSession;

    async fn open(&mut self, resume: &ResumeOffsets) -> Result<Self::Session, ReplicationError>;
}

/// A running capture session.
#[async_trait]
pub trait CaptureSession: Send {
    /// Names of the table columns the session delivers, in order.
    fn columns(&self) -> &[String];

    /// The next record, or `None` once the server ends the session.
    async fn next_record(&mut self) -> Result<Option<RawRecord>, ReplicationError>;
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Column set the session must deliver.
    pub expected_columns: Vec<String>,
    /// Idle time after which the session is rotated.
    pub read_timeout: Duration,
    pub reconnect: RetryPolicy,
}

pub struct ChangeStreamReader<S: CaptureSource> {
    source: S,
    config: ReaderConfig,
    floor: ResumeOffsets,
    delivered: ResumeOffsets,
    session: Option<S::Session>,
    failures: u32,
    rotations: u64,
    shutdown: ShutdownSignal,
}

impl<S: CaptureSource> ChangeStreamReader<S> {
    /// Reader that never yields a record below `resume` on any partition.
    pub fn new(source: S, config: ReaderConfig, resume: ResumeOffsets, shutdown: ShutdownSignal) -> Self {
        Self {
            source,
            config,
            floor: resume,
            delivered: ResumeOffsets::new(),
            session: None,
            failures: 0,
            rotations: 0,
            shutdown,
        }
    }

    /// Offsets the next session opens at: the last delivered offset of each
    /// partition, else the starting floor.
    pub fn resume_offsets(&self) -> ResumeOffsets {
        let mut offsets = self.floor.clone();
        for (partition, offset) in &self.delivered {
            offsets.insert(*partition, *offset);
        }
        offsets
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Wait for the next record. Returns `Ok(None)` once shutdown is requested.
    pub async fn next(&mut self) -> Result<Option<RawRecord>, ReplicationError> {
        loop {
            if self.shutdown.is_requested() {
                return Ok(None);
            }

            if self.session.is_none() {
                if self.failures > 0 {
                    let delay = self.config.reconnect.delay_for(self.failures);
                    tokio::select! {
                        _ = self.shutdown.requested() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                let resume = self.resume_offsets();
                let timeout = self.config.read_timeout;
                let opened = tokio::select! {
                    _ = self.shutdown.requested() => return Ok(None),
                    opened = tokio::time::timeout(timeout, self.source.open(&resume)) => opened,
                };
                let opened = opened.unwrap_or(Err(ReplicationError::Timeout {
                    operation: "opening the capture session",
                    timeout,
                }));
                match opened {
                    Ok(session) => {
                        self.check_columns(session.columns())?;
                        tracing::debug!("Capture session opened at {} partition offsets", resume.len());
                        self.session = Some(session);
                    }
                    Err(e) if e.is_transient() => {
                        self.record_failure(e)?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let session = match self.session.as_mut() {
                Some(session) => session,
                None => continue,
            };
            let fetched = tokio::select! {
                _ = self.shutdown.requested() => return Ok(None),
                fetched = tokio::time::timeout(self.config.read_timeout, session.next_record()) => fetched,
            };

            match fetched {
                Err(_) => {
                    self.rotations += 1;
                    tracing::debug!(
                        "No change records for {:?}, rotating capture session",
                        self.config.read_timeout
                    );
                    self.session = None;
                }
                Ok(Ok(Some(record))) => {
                    if record.values.len() != self.config.expected_columns.len() {
                        return Err(ReplicationError::SchemaMismatch(format!(
                            "record at {} has {} columns, expected {}",
                            record.position(),
                            record.values.len(),
                            self.config.expected_columns.len()
                        )));
                    }
                    if self.already_seen(record.header.partition_id, &record.header.offset) {
                        continue;
                    }
                    self.failures = 0;
                    self.delivered
                        .insert(record.header.partition_id, record.header.offset);
                    return Ok(Some(record));
                }
                Ok(Ok(None)) => {
                    self.session = None;
                    self.record_failure(ReplicationError::Connection(
                        "capture session ended".to_string(),
                    ))?;
                }
                Ok(Err(e)) if e.is_transient() => {
                    self.session = None;
                    self.record_failure(e)?;
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    fn already_seen(&self, partition: u32, offset: &Offset) -> bool {
        if let Some(delivered) = self.delivered.get(&partition) {
            return offset <= delivered;
        }
        matches!(self.floor.get(&partition), Some(floor) if offset < floor)
    }

    fn check_columns(&self, actual: &[String]) -> Result<(), ReplicationError> {
        if actual != self.config.expected_columns.as_slice() {
            return Err(ReplicationError::SchemaMismatch(format!(
                "capture session delivers columns [{}], expected [{}]",
                actual.join(", "),
                self.config.expected_columns.join(", ")
            )));
        }
        Ok(())
    }

    fn record_failure(&mut self, err: ReplicationError) -> Result<(), ReplicationError> {
        self.failures += 1;
        if !self.config.reconnect.allows(self.failures) {
            return Err(ReplicationError::Connection(format!(
                "giving up after {} consecutive failures: {}",
                self.failures, err
            )));
        }
        tracing::warn!(
            "Capture session failed (attempt {}/{}), reconnecting: {}",
            self.failures,
            self.config.reconnect.max_attempts + 1,
            err
        );
        Ok(())
    }
}

/// Run `reader` on its own task, feeding a bounded queue. The task ends after
/// forwarding an error, on shutdown, or when the receiver is dropped.
pub fn spawn_reader<S>(
    mut reader: ChangeStreamReader<S>,
    capacity: usize,
) -> (mpsc::Receiver<Result<RawRecord, ReplicationError>>, JoinHandle<()>)
where
    S: CaptureSource + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        loop {
            match reader.next().await {
                Ok(Some(record)) => {
                    if tx.send(Ok(record)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
        tracing::debug!("Change stream reader task finished");
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::record::{RecordHeader, TxId};
    use crate::shutdown;
    use mysql_async::Value as RawValue;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    enum Step {
        Record(u64),
        Fail,
        End,
    }

    struct FakeSource {
        sessions: VecDeque<Vec<Step>>,
        columns: Vec<String>,
        opened_at: Arc<Mutex<Vec<ResumeOffsets>>>,
    }

    struct FakeSession {
        steps: VecDeque<Step>,
        columns: Vec<String>,
    }

    fn record(seq: u64) -> RawRecord {
        RawRecord {
            header: RecordHeader {
                offset: Offset::from_sequence(seq),
                partition_id: 0,
                record_type: "Insert".to_string(),
                table: "t".to_string(),
                tx_id: TxId::from("tx"),
                tx_partitions: 1,
                internal_id: Some(seq as i64),
            },
            values: vec![RawValue::Bytes(seq.to_string().into_bytes())],
        }
    }

    #[async_trait]
    impl CaptureSource for FakeSource {
        type Session = FakeSession;

        async fn open(&mut self, resume: &ResumeOffsets) -> Result<FakeSession, ReplicationError> {
            self.opened_at.lock().unwrap().push(resume.clone());
            match self.sessions.pop_front() {
                Some(steps) => Ok(FakeSession {
                    steps: steps.into(),
                    columns: self.columns.clone(),
                }),
                None => Err(ReplicationError::Connection("refused".into())),
            }
        }
    }

    #[async_trait]
    impl CaptureSession for FakeSession {
        fn columns(&self) -> &[String] {
            &self.columns
        }

        async fn next_record(&mut self) -> Result<Option<RawRecord>, ReplicationError> {
            match self.steps.pop_front() {
                Some(Step::Record(seq)) => Ok(Some(record(seq))),
                Some(Step::Fail) => Err(ReplicationError::Connection("reset by peer".into())),
                Some(Step::End) => Ok(None),
                None => std::future::pending().await,
            }
        }
    }

    fn config(attempts: u32) -> ReaderConfig {
        ReaderConfig {
            expected_columns: vec!["a".to_string()],
            read_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy {
                max_attempts: attempts,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
            },
        }
    }

    fn source(sessions: Vec<Vec<Step>>) -> (FakeSource, Arc<Mutex<Vec<ResumeOffsets>>>) {
        let opened_at = Arc::new(Mutex::new(Vec::new()));
        (
            FakeSource {
                sessions: sessions.into(),
                columns: vec!["a".to_string()],
                opened_at: opened_at.clone(),
            },
            opened_at,
        )
    }

    #[tokio::test]
    async fn test_reconnect_resumes_without_duplicates() {
        let (src, opened_at) = source(vec![
            vec![Step::Record(1), Step::Record(2), Step::Fail],
            // Resumed session replays the last delivered offset.
            vec![Step::Record(2), Step::Record(3)],
        ]);
        let (_handle, signal) = shutdown::channel();
        let mut reader = ChangeStreamReader::new(src, config(3), ResumeOffsets::new(), signal);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(reader.next().await.unwrap().unwrap().header.offset);
        }
        assert_eq!(
            seen,
            vec![
                Offset::from_sequence(1),
                Offset::from_sequence(2),
                Offset::from_sequence(3)
            ]
        );
        let opened = opened_at.lock().unwrap();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].is_empty());
        assert_eq!(opened[1].get(&0), Some(&Offset::from_sequence(2)));
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let (src, opened_at) = source(vec![vec![Step::End]]);
        let (_handle, signal) = shutdown::channel();
        let mut reader = ChangeStreamReader::new(src, config(2), ResumeOffsets::new(), signal);

        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Connection(_)));
        // One good open, then two refused reconnects.
        assert_eq!(opened_at.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_fatal() {
        let (mut src, _) = source(vec![vec![Step::Record(1)]]);
        src.columns = vec!["a".to_string(), "b".to_string()];
        let (_handle, signal) = shutdown::channel();
        let mut reader = ChangeStreamReader::new(src, config(3), ResumeOffsets::new(), signal);
        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, ReplicationError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_floor_filters_older_records() {
        let (src, opened_at) = source(vec![vec![Step::Record(3), Step::Record(4), Step::Record(5)]]);
        let mut resume = ResumeOffsets::new();
        resume.insert(0, Offset::from_sequence(4));
        let (_handle, signal) = shutdown::channel();
        let mut reader = ChangeStreamReader::new(src, config(3), resume.clone(), signal);

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.header.offset, Offset::from_sequence(4));
        assert_eq!(opened_at.lock().unwrap()[0], resume);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let (src, _) = source(vec![vec![]]);
        let (handle, signal) = shutdown::channel();
        let mut reader = ChangeStreamReader::new(src, config(3), ResumeOffsets::new(), signal);

        let waiter = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_session_rotates_without_spending_budget() {
        let (src, opened_at) = source(vec![vec![], vec![], vec![Step::Record(1)]]);
        let (_handle, signal) = shutdown::channel();
        let mut cfg = config(0);
        cfg.read_timeout = Duration::from_millis(10);
        let mut reader = ChangeStreamReader::new(src, cfg, ResumeOffsets::new(), signal);

        let record = reader.next().await.unwrap().unwrap();
        assert_eq!(record.header.offset, Offset::from_sequence(1));
        assert_eq!(reader.rotations(), 2);
        assert_eq!(opened_at.lock().unwrap().len(), 3);
    }

    struct StalledSource {
        opens: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl CaptureSource for StalledSource {
        type Session = FakeSession;

        async fn open(&mut self, _resume: &ResumeOffsets) -> Result<FakeSession, ReplicationError> {
            *self.opens.lock().unwrap() += 1;
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_open_times_out_into_reconnect_budget() {
        let opens = Arc::new(Mutex::new(0));
        let src = StalledSource { opens: opens.clone() };
        let (_handle, signal) = shutdown::channel();
        let mut cfg = config(1);
        cfg.read_timeout = Duration::from_millis(10);
        let mut reader = ChangeStreamReader::new(src, cfg, ResumeOffsets::new(), signal);

        let err = tokio::time::timeout(Duration::from_secs(2), reader.next())
            .await
            .expect("open must not hang")
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Connection(_)));
        assert!(err.to_string().contains("opening the capture session"));
        assert_eq!(*opens.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_open() {
        let src = StalledSource {
            opens: Arc::new(Mutex::new(0)),
        };
        let (handle, signal) = shutdown::channel();
        let mut reader = ChangeStreamReader::new(src, config(3), ResumeOffsets::new(), signal);

        let waiter = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawned_reader_forwards_errors() {
        let (src, _) = source(vec![vec![Step::Record(1), Step::End]]);
        let (_handle, signal) = shutdown::channel();
        let reader = ChangeStreamReader::new(src, config(0), ResumeOffsets::new(), signal);
        let (mut rx, task) = spawn_reader(reader, 1);

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
        task.await.unwrap();
    }
}
