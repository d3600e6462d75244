// ABOUTME: TargetApplier - applies one closed source transaction as one target transaction
// ABOUTME: Any failed statement rolls the whole transaction back; missing rows halt replication

use super::batcher::Transaction;
use super::decoder::{ChangeEvent, RowChange};
use super::record::Position;
use super::writer::TargetWriter;
use crate::error::ReplicationError;

pub struct TargetApplier<W: TargetWriter> {
    writer: W,
    target_table: String,
    key_columns: Vec<String>,
}

impl<W: TargetWriter> TargetApplier<W> {
    pub fn new(writer: W, target_table: &str, key_columns: Vec<String>) -> Self {
        Self {
            writer,
            target_table: target_table.to_string(),
            key_columns,
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Apply every event of `tx` and commit. Returns the commit position.
    pub async fn apply(&mut self, tx: &Transaction) -> Result<Position, ReplicationError> {
        self.writer.begin().await?;

        for event in tx.events() {
            if let Err(e) = self.apply_event(event).await {
                if let Err(rollback) = self.writer.rollback().await {
                    tracing::warn!("Rollback after failed statement also failed: {}", rollback);
                }
                return Err(e);
            }
        }

        if let Err(e) = self.writer.commit().await {
            let _ = self.writer.rollback().await;
            return Err(e);
        }

        tracing::debug!(
            "Applied transaction {} ({} rows) offset={}:{}",
            tx.id(),
            tx.len(),
            tx.begin_position(),
            tx.commit_position().offset
        );
        Ok(tx.commit_position())
    }

    /// Roll back whatever an interrupted `apply` left open.
    pub async fn abort(&mut self) -> Result<(), ReplicationError> {
        self.writer.rollback().await
    }

    async fn apply_event(&mut self, event: &ChangeEvent) -> Result<(), ReplicationError> {
        match &event.change {
            RowChange::Insert { after } => self.writer.upsert(after).await,
            RowChange::Update { after, .. } => {
                let key = event.key(&self.key_columns)?;
                let affected = self.writer.update(&key, after).await?;
                self.expect_row(affected, &key)
            }
            RowChange::Delete { .. } => {
                let key = event.key(&self.key_columns)?;
                let affected = self.writer.delete(&key).await?;
                self.expect_row(affected, &key)
            }
        }
    }

    fn expect_row(
        &self,
        affected: u64,
        key: &super::decoder::ColumnValues,
    ) -> Result<(), ReplicationError> {
        if affected > 0 {
            return Ok(());
        }
        let key = key
            .iter()
            .map(|(column, value)| format!("{}={}", column, value))
            .collect::<Vec<_>>()
            .join(", ");
        Err(ReplicationError::RowNotFound {
            table: self.target_table.clone(),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::batcher::{BatcherConfig, TransactionBatcher};
    use crate::cdc::decoder::{ColumnValues, Marker, MarkerKind, StreamEvent};
    use crate::cdc::record::{Offset, TxId};
    use crate::cdc::types::Value;
    use async_trait::async_trait;

    /// Records statements; `update` and `delete` find no row.
    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
    }

    #[async_trait]
    impl TargetWriter for Recorder {
        async fn begin(&mut self) -> Result<(), ReplicationError> {
            self.log.push("begin".into());
            Ok(())
        }
        async fn upsert(&mut self, row: &ColumnValues) -> Result<(), ReplicationError> {
            self.log.push(format!("upsert {}", row["id"]));
            Ok(())
        }
        async fn update(&mut self, key: &ColumnValues, _row: &ColumnValues) -> Result<u64, ReplicationError> {
            self.log.push(format!("update {}", key["id"]));
            Ok(0)
        }
        async fn delete(&mut self, key: &ColumnValues) -> Result<u64, ReplicationError> {
            self.log.push(format!("delete {}", key["id"]));
            Ok(0)
        }
        async fn commit(&mut self) -> Result<(), ReplicationError> {
            self.log.push("commit".into());
            Ok(())
        }
        async fn rollback(&mut self) -> Result<(), ReplicationError> {
            self.log.push("rollback".into());
            Ok(())
        }
    }

    fn transaction(changes: Vec<RowChange>) -> Transaction {
        let at = |seq: u64| Position {
            partition: 0,
            offset: Offset::from_sequence(seq),
        };
        let marker = |kind, seq| {
            StreamEvent::Marker(Marker {
                kind,
                tx_id: TxId::from("t1"),
                position: at(seq),
            })
        };
        let mut events = vec![marker(MarkerKind::BeginTransaction, 1)];
        for (i, change) in changes.into_iter().enumerate() {
            events.push(StreamEvent::Row(ChangeEvent {
                table: "x_table".into(),
                tx_id: TxId::from("t1"),
                sequence: 0,
                position: at(i as u64 + 2),
                change,
            }));
        }
        events.push(marker(MarkerKind::CommitTransaction, 100));

        let mut batcher = TransactionBatcher::new(BatcherConfig::default());
        let mut closed: Vec<Transaction> = batcher
            .transactions(events)
            .collect::<Result<_, _>>()
            .unwrap();
        closed.pop().unwrap()
    }

    fn image(id: i64) -> ColumnValues {
        let mut row = ColumnValues::new();
        row.insert("id".into(), Value::Int(id));
        row.insert("val".into(), Value::Text("x".into()));
        row
    }

    #[tokio::test]
    async fn test_applies_inside_one_transaction() {
        let tx = transaction(vec![
            RowChange::Insert { after: image(1) },
            RowChange::Insert { after: image(2) },
        ]);
        let mut applier = TargetApplier::new(Recorder::default(), "public.mirror", vec!["id".into()]);

        let position = applier.apply(&tx).await.unwrap();
        assert_eq!(position, tx.commit_position());
        assert_eq!(
            applier.writer().log,
            vec!["begin", "upsert 1", "upsert 2", "commit"]
        );
    }

    #[tokio::test]
    async fn test_missing_row_rolls_back_and_names_key() {
        let mut key = ColumnValues::new();
        key.insert("id".into(), Value::Int(7));
        let tx = transaction(vec![
            RowChange::Insert { after: image(1) },
            RowChange::Delete { before: image(7) },
            RowChange::Update {
                before: key,
                after: image(7),
            },
        ]);
        let mut applier = TargetApplier::new(Recorder::default(), "public.mirror", vec!["id".into()]);

        let err = applier.apply(&tx).await.unwrap_err();
        match err {
            ReplicationError::RowNotFound { table, key } => {
                assert_eq!(table, "public.mirror");
                assert_eq!(key, "id=7");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            applier.writer().log,
            vec!["begin", "upsert 1", "delete 7", "rollback"]
        );
    }
}
