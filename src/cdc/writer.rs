// ABOUTME: Target-side statement writer for the PostgreSQL mirror table
// ABOUTME: Explicit transaction control plus upsert, keyed update and keyed delete

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::decoder::ColumnValues;
use super::types::{TypeMap, Value};
use crate::error::{DecodeError, ReplicationError};
use crate::table::{KeyStrategy, TableDefinition, INTERNAL_ID_COLUMN};
use crate::utils::quote_ident;

/// Row-level statements against one target table, inside explicit transactions.
#[async_trait]
pub trait TargetWriter: Send {
    async fn begin(&mut self) -> Result<(), ReplicationError>;

    /// Insert `row`, overwriting any existing row with the same key.
    async fn upsert(&mut self, row: &ColumnValues) -> Result<(), ReplicationError>;

    /// Overwrite the row addressed by `key` with `row`. Returns rows affected.
    async fn update(&mut self, key: &ColumnValues, row: &ColumnValues) -> Result<u64, ReplicationError>;

    /// Delete the row addressed by `key`. Returns rows affected.
    async fn delete(&mut self, key: &ColumnValues) -> Result<u64, ReplicationError>;

    async fn commit(&mut self) -> Result<(), ReplicationError>;

    /// Abandon the open transaction, if any.
    async fn rollback(&mut self) -> Result<(), ReplicationError>;
}

/// Writes to `schema.table` over its own connection, reconnecting at the
/// start of a transaction when the previous connection was lost.
pub struct PostgresWriter {
    url: String,
    schema: String,
    table: String,
    key_columns: Vec<String>,
    client: Option<Client>,
    in_transaction: bool,
}

impl PostgresWriter {
    pub fn new(url: &str, schema: &str, table: &str, key_columns: Vec<String>) -> Self {
        Self {
            url: url.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            key_columns,
            client: None,
            in_transaction: false,
        }
    }

    /// Reuse an already established connection.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Create the mirror table if it does not exist yet.
    pub async fn ensure_table(
        &mut self,
        source: &TableDefinition,
        type_map: &TypeMap,
    ) -> Result<(), ReplicationError> {
        let sql = create_table_sql(&self.schema, &self.table, source, type_map)?;
        tracing::debug!("{}", sql);
        self.connected().await?.batch_execute(&sql).await?;
        tracing::info!("Target table {} is ready", self.qualified_table());
        Ok(())
    }

    async fn connected(&mut self) -> Result<&Client, ReplicationError> {
        let stale = match &self.client {
            Some(client) => client.is_closed(),
            None => true,
        };
        if stale {
            if self.client.is_some() {
                tracing::warn!("Target connection lost, reconnecting");
            }
            self.client = None;
            self.in_transaction = false;
            self.client = Some(crate::postgres::open(&self.url).await?);
        }
        self.client
            .as_ref()
            .ok_or_else(|| ReplicationError::Connection("target is not connected".to_string()))
    }

    fn client(&self) -> Result<&Client, ReplicationError> {
        self.client
            .as_ref()
            .ok_or_else(|| ReplicationError::Connection("target is not connected".to_string()))
    }

    async fn execute(&self, query: &str, values: &[&Value]) -> Result<u64, ReplicationError> {
        tracing::debug!("{}", query);
        let params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| *v as &(dyn ToSql + Sync))
            .collect();
        Ok(self.client()?.execute(query, &params).await?)
    }
}

#[async_trait]
impl TargetWriter for PostgresWriter {
    async fn begin(&mut self) -> Result<(), ReplicationError> {
        if self.in_transaction {
            // A previous attempt left its transaction open.
            self.rollback().await?;
        }
        self.connected().await?.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn upsert(&mut self, row: &ColumnValues) -> Result<(), ReplicationError> {
        let columns: Vec<String> = row.keys().cloned().collect();
        let query = build_upsert_query(&self.schema, &self.table, &self.key_columns, &columns);
        let values: Vec<&Value> = row.values().collect();
        self.execute(&query, &values).await?;
        Ok(())
    }

    async fn update(&mut self, key: &ColumnValues, row: &ColumnValues) -> Result<u64, ReplicationError> {
        let set_columns: Vec<String> = row.keys().cloned().collect();
        let key_columns: Vec<String> = key.keys().cloned().collect();
        let query = build_update_query(&self.schema, &self.table, &set_columns, &key_columns);
        let values: Vec<&Value> = row.values().chain(key.values()).collect();
        self.execute(&query, &values).await
    }

    async fn delete(&mut self, key: &ColumnValues) -> Result<u64, ReplicationError> {
        let key_columns: Vec<String> = key.keys().cloned().collect();
        let query = build_delete_query(&self.schema, &self.table, &key_columns);
        let values: Vec<&Value> = key.values().collect();
        self.execute(&query, &values).await
    }

    async fn commit(&mut self) -> Result<(), ReplicationError> {
        tracing::debug!("COMMIT");
        self.client()?.batch_execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ReplicationError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        match &self.client {
            // The server discards the transaction with the connection.
            Some(client) if !client.is_closed() => {
                tracing::debug!("ROLLBACK");
                client.batch_execute("ROLLBACK").await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Build a single-row upsert.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("col1", "col2", "col3")
/// VALUES ($1, $2, $3)
/// ON CONFLICT ("pk_col") DO UPDATE SET
///   "col2" = EXCLUDED."col2",
///   "col3" = EXCLUDED."col3"
/// ```
pub fn build_upsert_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[String],
    all_columns: &[String],
) -> String {
    let quoted_columns: Vec<String> = all_columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_pk_columns: Vec<String> = primary_key_columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=all_columns.len()).map(|i| format!("${}", i)).collect();

    // Build UPDATE SET clause for non-PK columns
    let update_columns: Vec<String> = all_columns
        .iter()
        .filter(|c| !primary_key_columns.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        // All columns are PKs - use DO NOTHING
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {}.{} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        quote_ident(schema),
        quote_ident(table),
        quoted_columns.join(", "),
        placeholders.join(", "),
        quoted_pk_columns.join(", "),
        update_clause
    )
}

/// Build a keyed update. Parameters are the SET values followed by the key values.
///
/// ```sql
/// UPDATE "schema"."table" SET "col1" = $1, "col2" = $2 WHERE "pk" = $3
/// ```
pub fn build_update_query(
    schema: &str,
    table: &str,
    set_columns: &[String],
    primary_key_columns: &[String],
) -> String {
    let assignments: Vec<String> = set_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
        .collect();

    format!(
        "UPDATE {}.{} SET {} WHERE {}",
        quote_ident(schema),
        quote_ident(table),
        assignments.join(", "),
        key_predicate(primary_key_columns, set_columns.len())
    )
}

/// Build a keyed delete.
///
/// ```sql
/// DELETE FROM "schema"."table" WHERE "pk1" = $1 AND "pk2" = $2
/// ```
pub fn build_delete_query(schema: &str, table: &str, primary_key_columns: &[String]) -> String {
    format!(
        "DELETE FROM {}.{} WHERE {}",
        quote_ident(schema),
        quote_ident(table),
        key_predicate(primary_key_columns, 0)
    )
}

fn key_predicate(primary_key_columns: &[String], offset: usize) -> String {
    primary_key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), offset + i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `CREATE TABLE IF NOT EXISTS` for the mirror of `source`. Tables without a
/// primary key get the [`INTERNAL_ID_COLUMN`] as theirs.
pub fn create_table_sql(
    schema: &str,
    table: &str,
    source: &TableDefinition,
    type_map: &TypeMap,
) -> Result<String, DecodeError> {
    let key = source.key_strategy();
    let mut columns = Vec::with_capacity(source.columns.len() + 1);
    if key == KeyStrategy::InternalId {
        columns.push(format!("{} BIGINT NOT NULL", quote_ident(INTERNAL_ID_COLUMN)));
    }
    for column in &source.columns {
        let target = type_map
            .resolve(&column.sql_type)
            .ok_or_else(|| DecodeError::UnmappedType {
                column: column.name.clone(),
                source_type: column.sql_type.clone(),
            })?;
        let null = if column.nullable && !column.primary_key {
            ""
        } else {
            " NOT NULL"
        };
        columns.push(format!("{} {}{}", quote_ident(&column.name), target.pg_type(), null));
    }
    let key_columns: Vec<String> = key.columns().iter().map(|c| quote_ident(c)).collect();
    columns.push(format!("PRIMARY KEY ({})", key_columns.join(", ")));

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        quote_ident(schema),
        quote_ident(table),
        columns.join(", ")
    ))
}
