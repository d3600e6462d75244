// ABOUTME: Raw change-capture records as the OBSERVE result set delivers them
// ABOUTME: Parses the auxiliary header columns and defines offsets and positions

use mysql_async::Value as RawValue;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::DecodeError;
use crate::utils::{from_hex, to_hex};

/// Names of the auxiliary columns that precede the table's own columns.
pub const AUX_COLUMN_NAMES: [&str; 7] = [
    "Offset",
    "PartitionId",
    "Type",
    "Table",
    "TxId",
    "TxPartitions",
    "InternalId",
];

pub const OFFSET_LEN: usize = 24;

/// Opaque, per-partition monotonically increasing stream offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset([u8; OFFSET_LEN]);

impl Offset {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: [u8; OFFSET_LEN] = bytes.try_into().map_err(|_| {
            DecodeError::MalformedRecord(format!(
                "expected an offset with {} bytes, got {}",
                OFFSET_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, DecodeError> {
        let bytes = from_hex(text)
            .ok_or_else(|| DecodeError::MalformedRecord(format!("invalid offset hex `{}`", text)))?;
        Self::from_bytes(&bytes)
    }

    /// Offset whose trailing eight bytes hold `value` big-endian; handy for
    /// fabricated streams.
    pub fn from_sequence(value: u64) -> Self {
        let mut raw = [0u8; OFFSET_LEN];
        raw[OFFSET_LEN - 8..].copy_from_slice(&value.to_be_bytes());
        Self(raw)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({})", self.to_hex())
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Offset::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// A point in the change stream: the offset within one source partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub partition: u32,
    pub offset: Offset,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

/// Per-partition offsets a capture session starts from.
pub type ResumeOffsets = BTreeMap<u32, Offset>;

/// Source transaction identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub Vec<u8>);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self)
    }
}

impl From<&str> for TxId {
    fn from(value: &str) -> Self {
        TxId(value.as_bytes().to_vec())
    }
}

/// The seven auxiliary columns of a change record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub offset: Offset,
    pub partition_id: u32,
    pub record_type: String,
    pub table: String,
    pub tx_id: TxId,
    pub tx_partitions: i64,
    pub internal_id: Option<i64>,
}

impl RecordHeader {
    pub fn position(&self) -> Position {
        Position {
            partition: self.partition_id,
            offset: self.offset,
        }
    }
}

/// One row of the capture session: the header plus the table's column values
/// in declaration order, still in wire representation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub header: RecordHeader,
    pub values: Vec<RawValue>,
}

impl RawRecord {
    pub fn from_values(mut values: Vec<RawValue>) -> Result<Self, DecodeError> {
        if values.len() < AUX_COLUMN_NAMES.len() {
            return Err(DecodeError::MalformedRecord(format!(
                "expected at least {} auxiliary columns, got {}",
                AUX_COLUMN_NAMES.len(),
                values.len()
            )));
        }
        let data = values.split_off(AUX_COLUMN_NAMES.len());
        let mut aux = values.into_iter();
        let mut next = || aux.next().unwrap_or(RawValue::NULL);

        let offset = match next() {
            RawValue::Bytes(bytes) => Offset::from_bytes(&bytes)?,
            other => {
                return Err(DecodeError::MalformedRecord(format!(
                    "offset is not binary: {:?}",
                    other
                )))
            }
        };
        let partition_id = aux_int(&next(), "PartitionId")?
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| DecodeError::MalformedRecord("missing partition id".to_string()))?;
        let record_type = aux_text(next(), "Type")?
            .ok_or_else(|| DecodeError::MalformedRecord("missing record type".to_string()))?;
        let table = aux_text(next(), "Table")?.unwrap_or_default();
        let tx_id = match next() {
            RawValue::Bytes(bytes) => TxId(bytes),
            RawValue::NULL => TxId(Vec::new()),
            other => TxId(other.as_sql(true).into_bytes()),
        };
        let tx_partitions = aux_int(&next(), "TxPartitions")?.unwrap_or(0);
        let internal_id = aux_int(&next(), "InternalId")?;

        Ok(Self {
            header: RecordHeader {
                offset,
                partition_id,
                record_type,
                table,
                tx_id,
                tx_partitions,
                internal_id,
            },
            values: data,
        })
    }

    pub fn position(&self) -> Position {
        self.header.position()
    }
}

fn aux_int(value: &RawValue, column: &str) -> Result<Option<i64>, DecodeError> {
    match value {
        RawValue::NULL => Ok(None),
        RawValue::Int(v) => Ok(Some(*v)),
        RawValue::UInt(v) => i64::try_from(*v).map(Some).map_err(|_| {
            DecodeError::MalformedRecord(format!("{} out of range: {}", column, v))
        }),
        RawValue::Bytes(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(Some)
            .ok_or_else(|| DecodeError::MalformedRecord(format!("{} is not an integer", column))),
        other => Err(DecodeError::MalformedRecord(format!(
            "{} has unexpected value {:?}",
            column, other
        ))),
    }
}

fn aux_text(value: RawValue, column: &str) -> Result<Option<String>, DecodeError> {
    match value {
        RawValue::NULL => Ok(None),
        RawValue::Bytes(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| DecodeError::MalformedRecord(format!("{} is not valid UTF-8", column))),
        other => Err(DecodeError::MalformedRecord(format!(
            "{} has unexpected value {:?}",
            column, other
        ))),
    }
}
