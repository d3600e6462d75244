// ABOUTME: Decodes raw capture records into typed change events and boundary markers
// ABOUTME: Pure mapping driven by the table definition and the source-to-target type map

use std::collections::BTreeMap;

use super::record::{Position, RawRecord, TxId};
use super::types::{convert, TargetType, TypeMap, Value};
use crate::error::DecodeError;
use crate::table::{KeyStrategy, TableDefinition, INTERNAL_ID_COLUMN};

/// Column name → decoded value.
pub type ColumnValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// The row images a change carries. Updates keep only the key columns in
/// `before`; the full new row is in `after`.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert { after: ColumnValues },
    Update { before: ColumnValues, after: ColumnValues },
    Delete { before: ColumnValues },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub tx_id: TxId,
    /// Position of the event within its transaction, assigned by the batcher.
    pub sequence: u64,
    pub position: Position,
    pub change: RowChange,
}

impl ChangeEvent {
    pub fn operation(&self) -> Operation {
        match self.change {
            RowChange::Insert { .. } => Operation::Insert,
            RowChange::Update { .. } => Operation::Update,
            RowChange::Delete { .. } => Operation::Delete,
        }
    }

    pub fn before(&self) -> Option<&ColumnValues> {
        match &self.change {
            RowChange::Update { before, .. } | RowChange::Delete { before } => Some(before),
            RowChange::Insert { .. } => None,
        }
    }

    pub fn after(&self) -> Option<&ColumnValues> {
        match &self.change {
            RowChange::Insert { after } | RowChange::Update { after, .. } => Some(after),
            RowChange::Delete { .. } => None,
        }
    }

    /// Key values addressing the target row: from the after-image for inserts,
    /// from the before-image for updates and deletes.
    pub fn key(&self, key_columns: &[String]) -> Result<ColumnValues, DecodeError> {
        let image = match &self.change {
            RowChange::Insert { after } => after,
            RowChange::Update { before, .. } | RowChange::Delete { before } => before,
        };
        project_key(image, key_columns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
    BeginSnapshot,
    CommitSnapshot,
}

/// A transaction or snapshot boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub tx_id: TxId,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Row(ChangeEvent),
    Marker(Marker),
}

/// Stateless decoder for one table.
#[derive(Debug, Clone)]
pub struct ChangeEventDecoder {
    table: String,
    columns: Vec<(String, String, Option<TargetType>)>,
    key: KeyStrategy,
}

impl ChangeEventDecoder {
    pub fn new(table: &TableDefinition, type_map: &TypeMap) -> Self {
        let columns = table
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.sql_type.clone(), type_map.resolve(&c.sql_type)))
            .collect();
        Self {
            table: table.name.clone(),
            columns,
            key: table.key_strategy(),
        }
    }

    /// Fail fast on the first column whose source type has no mapping.
    pub fn validate(&self) -> Result<(), DecodeError> {
        match self.columns.iter().find(|(_, _, target)| target.is_none()) {
            Some((name, sql_type, _)) => Err(DecodeError::UnmappedType {
                column: name.clone(),
                source_type: sql_type.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn key_columns(&self) -> Vec<String> {
        self.key.columns()
    }

    pub fn decode(&self, raw: &RawRecord) -> Result<StreamEvent, DecodeError> {
        let header = &raw.header;
        let marker = |kind: MarkerKind| -> Result<StreamEvent, DecodeError> {
            Ok(StreamEvent::Marker(Marker {
                kind,
                tx_id: header.tx_id.clone(),
                position: header.position(),
            }))
        };

        let operation = match header.record_type.as_str() {
            "Insert" => Operation::Insert,
            "Update" => Operation::Update,
            "Delete" => Operation::Delete,
            "BeginTransaction" => return marker(MarkerKind::BeginTransaction),
            "CommitTransaction" => return marker(MarkerKind::CommitTransaction),
            "RollbackTransaction" => return marker(MarkerKind::RollbackTransaction),
            "BeginSnapshot" => return marker(MarkerKind::BeginSnapshot),
            "CommitSnapshot" => return marker(MarkerKind::CommitSnapshot),
            other => return Err(DecodeError::UnknownRecordType(other.to_string())),
        };

        let row = self.decode_row(raw)?;
        let key_columns = self.key.columns();
        let change = match operation {
            Operation::Insert => {
                project_key(&row, &key_columns)?;
                RowChange::Insert { after: row }
            }
            Operation::Update => RowChange::Update {
                before: project_key(&row, &key_columns)?,
                after: row,
            },
            Operation::Delete => {
                project_key(&row, &key_columns)?;
                RowChange::Delete { before: row }
            }
        };

        Ok(StreamEvent::Row(ChangeEvent {
            table: self.table.clone(),
            tx_id: header.tx_id.clone(),
            sequence: 0,
            position: header.position(),
            change,
        }))
    }

    fn decode_row(&self, raw: &RawRecord) -> Result<ColumnValues, DecodeError> {
        if raw.values.len() != self.columns.len() {
            return Err(DecodeError::MalformedRecord(format!(
                "expected {} column values, got {}",
                self.columns.len(),
                raw.values.len()
            )));
        }

        let mut row = ColumnValues::new();
        for ((name, sql_type, target), value) in self.columns.iter().zip(&raw.values) {
            let target = target.ok_or_else(|| DecodeError::UnmappedType {
                column: name.clone(),
                source_type: sql_type.clone(),
            })?;
            row.insert(name.clone(), convert(name, target, value)?);
        }

        if self.key == KeyStrategy::InternalId {
            let id = raw
                .header
                .internal_id
                .ok_or_else(|| DecodeError::MissingKeyColumn(INTERNAL_ID_COLUMN.to_string()))?;
            row.insert(INTERNAL_ID_COLUMN.to_string(), Value::Int(id));
        }
        Ok(row)
    }
}

fn project_key(image: &ColumnValues, key_columns: &[String]) -> Result<ColumnValues, DecodeError> {
    key_columns
        .iter()
        .map(|column| match image.get(column) {
            Some(value) if !value.is_null() => Ok((column.clone(), value.clone())),
            _ => Err(DecodeError::MissingKeyColumn(column.clone())),
        })
        .collect()
}
