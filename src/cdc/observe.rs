// ABOUTME: SingleStore OBSERVE capture source built on mysql_async
// ABOUTME: Streams the server-side result set from a dedicated connection and kills it on drop

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row, Value as RawValue};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::reader::{CaptureSession, CaptureSource};
use super::record::{RawRecord, ResumeOffsets, AUX_COLUMN_NAMES};
use crate::error::ReplicationError;
use crate::table::TableDefinition;
use crate::utils::{quote_mysql_ident, sanitize_url};

/// Returned by `SHOW PARTITIONS` on a database that is not sharded.
const ER_DISTRIBUTED_DATABASE_NOT_SHARDED: u16 = 1795;

/// Build the OBSERVE statement. Without resume offsets the session starts
/// with a snapshot of the table; otherwise every partition gets an entry,
/// `NULL` where no offset is known.
pub fn build_observe_query(table: &str, partitions: usize, resume: &ResumeOffsets) -> String {
    let mut query = format!("OBSERVE * FROM {}", quote_mysql_ident(table));
    if !resume.is_empty() {
        let offsets: Vec<String> = (0..partitions as u32)
            .map(|p| match resume.get(&p) {
                Some(offset) => format!("'{}'", offset.to_hex()),
                None => "NULL".to_string(),
            })
            .collect();
        query.push_str(&format!(" BEGIN AT ({})", offsets.join(", ")));
    }
    query
}

/// Count partitions of `database`. Unsharded databases report one.
pub async fn discover_partitions(conn: &mut Conn, database: &str) -> Result<usize, ReplicationError> {
    let query = format!("SHOW PARTITIONS ON {}", quote_mysql_ident(database));
    let rows: Vec<Row> = match conn.query(query).await {
        Ok(rows) => rows,
        Err(mysql_async::Error::Server(e)) if e.code == ER_DISTRIBUTED_DATABASE_NOT_SHARDED => {
            return Ok(1)
        }
        Err(e) => return Err(e.into()),
    };

    // Each ordinal is listed once per replica.
    let ordinals: HashSet<String> = rows
        .iter()
        .filter_map(|row| row.get::<RawValue, _>("Ordinal"))
        .map(|v| v.as_sql(true))
        .collect();
    Ok(if ordinals.is_empty() {
        rows.len().max(1)
    } else {
        ordinals.len()
    })
}

/// Read the column set of `database.table` from information_schema.
pub async fn describe_table(
    conn: &mut Conn,
    database: &str,
    table: &str,
) -> Result<TableDefinition, ReplicationError> {
    let rows: Vec<(String, String, String, String)> = conn
        .exec(
            "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY \
             FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? \
             ORDER BY ordinal_position",
            (database, table),
        )
        .await?;

    if rows.is_empty() {
        return Err(ReplicationError::SchemaMismatch(format!(
            "table {}.{} does not exist or has no columns",
            database, table
        )));
    }

    Ok(rows.into_iter().fold(
        TableDefinition::new(table),
        |def, (name, sql_type, nullable, key)| {
            def.column(&name, &sql_type, nullable.eq_ignore_ascii_case("YES"), key == "PRI")
        },
    ))
}

/// Opens OBSERVE sessions against one table.
#[derive(Clone)]
pub struct ObserveSource {
    opts: Opts,
    pool: Pool,
    table: String,
    partitions: usize,
    buffer: usize,
}

impl ObserveSource {
    /// Connect to `database` and discover its partition count.
    pub async fn connect(url: &str, database: &str, table: &str, buffer: usize) -> Result<Self> {
        let opts = Opts::from_url(url)
            .with_context(|| format!("Invalid source URL {}", sanitize_url(url)))?;
        let opts: Opts = OptsBuilder::from_opts(opts)
            .db_name(Some(database.to_string()))
            .into();
        let pool = Pool::new(opts.clone());

        let mut conn = pool
            .get_conn()
            .await
            .with_context(|| format!("Failed to connect to source {}", sanitize_url(url)))?;
        let partitions = discover_partitions(&mut conn, database)
            .await
            .with_context(|| format!("Failed to list partitions of {}", database))?;
        drop(conn);

        tracing::info!(
            "Source database {} has {} partition(s)",
            database,
            partitions
        );

        Ok(Self {
            opts,
            pool,
            table: table.to_string(),
            partitions,
            buffer: buffer.max(1),
        })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl CaptureSource for ObserveSource {
    type Session = ObserveSession;

    async fn open(&mut self, resume: &ResumeOffsets) -> Result<ObserveSession, ReplicationError> {
        if let Some(partition) = resume.keys().find(|p| **p as usize >= self.partitions) {
            return Err(ReplicationError::SchemaMismatch(format!(
                "checkpoint refers to partition {} but the source has {} partition(s)",
                partition, self.partitions
            )));
        }

        let query = build_observe_query(&self.table, self.partitions, resume);
        let mut conn = Conn::new(self.opts.clone()).await?;
        let connection_id = conn.id();
        tracing::debug!("Running on connection {}: {}", connection_id, query);

        let (columns_tx, columns_rx) = oneshot::channel();
        let (records_tx, records_rx) = mpsc::channel(self.buffer);

        let task = tokio::spawn(async move {
            let mut result = match conn.query_iter(query).await {
                Ok(result) => result,
                Err(e) => {
                    let _ = columns_tx.send(Err(ReplicationError::from(e)));
                    return;
                }
            };
            let names: Vec<String> = result
                .columns()
                .map(|columns| columns.iter().map(|c| c.name_str().into_owned()).collect())
                .unwrap_or_default();
            if columns_tx.send(Ok(names)).is_err() {
                return;
            }

            loop {
                match result.next().await {
                    Ok(Some(row)) => {
                        let record = RawRecord::from_values(row.unwrap()).map_err(ReplicationError::from);
                        if records_tx.send(record).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = records_tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });

        let mut session = ObserveSession {
            columns: Vec::new(),
            records: records_rx,
            task,
            connection_id,
            pool: self.pool.clone(),
        };

        let names = match columns_rx.await {
            Ok(names) => names?,
            Err(_) => {
                return Err(ReplicationError::Connection(
                    "observe query ended before returning columns".to_string(),
                ))
            }
        };
        let aux_len = AUX_COLUMN_NAMES.len();
        if names.len() < aux_len
            || names[..aux_len]
                .iter()
                .zip(AUX_COLUMN_NAMES.iter())
                .any(|(actual, expected)| actual != expected)
        {
            return Err(ReplicationError::SchemaMismatch(format!(
                "observe result does not start with the auxiliary columns: [{}]",
                names.join(", ")
            )));
        }

        session.columns = names[aux_len..].to_vec();
        Ok(session)
    }
}

/// One running OBSERVE query.
pub struct ObserveSession {
    columns: Vec<String>,
    records: mpsc::Receiver<Result<RawRecord, ReplicationError>>,
    task: JoinHandle<()>,
    connection_id: u32,
    pool: Pool,
}

#[async_trait]
impl CaptureSession for ObserveSession {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>, ReplicationError> {
        match self.records.recv().await {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for ObserveSession {
    fn drop(&mut self) {
        self.task.abort();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let id = self.connection_id;
        runtime.spawn(async move {
            let killed = match pool.get_conn().await {
                Ok(mut conn) => conn.query_drop(format!("KILL CONNECTION {}", id)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = killed {
                tracing::debug!("Could not kill observe connection {}: {}", id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::record::Offset;

    #[test]
    fn test_observe_query_without_offsets_takes_snapshot() {
        assert_eq!(
            build_observe_query("x_table", 4, &ResumeOffsets::new()),
            "OBSERVE * FROM `x_table`"
        );
    }

    #[test]
    fn test_observe_query_with_partial_offsets() {
        let mut resume = ResumeOffsets::new();
        resume.insert(1, Offset::from_sequence(255));
        let query = build_observe_query("x_table", 3, &resume);
        assert_eq!(
            query,
            format!(
                "OBSERVE * FROM `x_table` BEGIN AT (NULL, '{}', NULL)",
                Offset::from_sequence(255).to_hex()
            )
        );
    }

    #[test]
    fn test_observe_query_quotes_table() {
        let mut resume = ResumeOffsets::new();
        resume.insert(0, Offset::from_sequence(1));
        let query = build_observe_query("we`ird", 1, &resume);
        assert!(query.starts_with("OBSERVE * FROM `we``ird` BEGIN AT ('"));
    }
}
