// ABOUTME: Source-type to target-type mapping and typed column values
// ABOUTME: Converts wire values from the capture session into values the target binds

use bytes::BytesMut;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use mysql_async::Value as RawValue;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::error::DecodeError;

/// Column types the target mirror table uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Boolean,
    Bigint,
    Double,
    Numeric,
    Text,
    Bytea,
    Date,
    Time,
    Timestamp,
    Jsonb,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Boolean => "boolean",
            TargetType::Bigint => "bigint",
            TargetType::Double => "double",
            TargetType::Numeric => "numeric",
            TargetType::Text => "text",
            TargetType::Bytea => "bytea",
            TargetType::Date => "date",
            TargetType::Time => "time",
            TargetType::Timestamp => "timestamp",
            TargetType::Jsonb => "jsonb",
        }
    }

    /// PostgreSQL column type used when the mirror table is created.
    pub fn pg_type(&self) -> &'static str {
        match self {
            TargetType::Boolean => "BOOLEAN",
            TargetType::Bigint => "BIGINT",
            TargetType::Double => "DOUBLE PRECISION",
            TargetType::Numeric => "NUMERIC",
            TargetType::Text => "TEXT",
            TargetType::Bytea => "BYTEA",
            TargetType::Date => "DATE",
            TargetType::Time => "TIME",
            TargetType::Timestamp => "TIMESTAMP",
            TargetType::Jsonb => "JSONB",
        }
    }
}

const DEFAULT_MAPPINGS: &[(&str, TargetType)] = &[
    ("tinyint", TargetType::Bigint),
    ("smallint", TargetType::Bigint),
    ("mediumint", TargetType::Bigint),
    ("int", TargetType::Bigint),
    ("integer", TargetType::Bigint),
    ("bigint", TargetType::Bigint),
    ("year", TargetType::Bigint),
    ("bool", TargetType::Boolean),
    ("boolean", TargetType::Boolean),
    ("double", TargetType::Double),
    ("real", TargetType::Double),
    ("float", TargetType::Double),
    ("decimal", TargetType::Numeric),
    ("dec", TargetType::Numeric),
    ("numeric", TargetType::Numeric),
    ("fixed", TargetType::Numeric),
    ("date", TargetType::Date),
    ("time", TargetType::Time),
    ("datetime", TargetType::Timestamp),
    ("timestamp", TargetType::Timestamp),
    ("char", TargetType::Text),
    ("varchar", TargetType::Text),
    ("tinytext", TargetType::Text),
    ("text", TargetType::Text),
    ("mediumtext", TargetType::Text),
    ("longtext", TargetType::Text),
    ("enum", TargetType::Text),
    ("set", TargetType::Text),
    ("geography", TargetType::Text),
    ("geographypoint", TargetType::Text),
    ("vector", TargetType::Text),
    ("binary", TargetType::Bytea),
    ("varbinary", TargetType::Bytea),
    ("tinyblob", TargetType::Bytea),
    ("blob", TargetType::Bytea),
    ("mediumblob", TargetType::Bytea),
    ("longblob", TargetType::Bytea),
    ("bit", TargetType::Bytea),
    ("bson", TargetType::Bytea),
    ("json", TargetType::Jsonb),
];

/// Source SQL type name → target type, keyed by the lowercased base type name
/// (`decimal(10, 5)` and `DECIMAL` both resolve through `decimal`).
#[derive(Debug, Clone, PartialEq)]
pub struct TypeMap {
    mappings: HashMap<String, TargetType>,
}

impl Default for TypeMap {
    fn default() -> Self {
        Self {
            mappings: DEFAULT_MAPPINGS
                .iter()
                .map(|(name, target)| (name.to_string(), *target))
                .collect(),
        }
    }
}

impl TypeMap {
    /// Default mappings with configured overrides layered on top.
    pub fn with_overrides(overrides: &BTreeMap<String, TargetType>) -> Self {
        let mut map = Self::default();
        for (name, target) in overrides {
            map.insert(name, *target);
        }
        map
    }

    pub fn insert(&mut self, source_type: &str, target: TargetType) {
        self.mappings.insert(base_type_name(source_type), target);
    }

    pub fn resolve(&self, source_type: &str) -> Option<TargetType> {
        self.mappings.get(&base_type_name(source_type)).copied()
    }
}

/// `DECIMAL(10, 5)` → `decimal`, `int unsigned` → `int`, `VECTOR(3)` → `vector`.
pub fn base_type_name(sql_type: &str) -> String {
    sql_type
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Numeric(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Bytes(v) => write!(f, "x'{}'", crate::utils::to_hex(v)),
            Value::Date(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql(ty, out),
            Value::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*v).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Numeric(v) => v.to_sql(ty, out),
            Value::Text(v) => v.to_sql(ty, out),
            Value::Bytes(v) => v.to_sql(ty, out),
            Value::Date(v) => v.to_sql(ty, out),
            Value::Time(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => v.to_sql(ty, out),
            Value::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Convert one wire value into `target`.
pub fn convert(column: &str, target: TargetType, raw: &RawValue) -> Result<Value, DecodeError> {
    if let RawValue::NULL = raw {
        return Ok(Value::Null);
    }
    let invalid = |reason: String| DecodeError::InvalidValue {
        column: column.to_string(),
        target_type: target.as_str(),
        reason,
    };

    match target {
        TargetType::Boolean => match raw {
            RawValue::Int(v) => Ok(Value::Bool(*v != 0)),
            RawValue::UInt(v) => Ok(Value::Bool(*v != 0)),
            _ => match text_of(raw).as_deref() {
                Some("1") | Some("true") | Some("TRUE") => Ok(Value::Bool(true)),
                Some("0") | Some("false") | Some("FALSE") => Ok(Value::Bool(false)),
                _ => Err(invalid(format!("{:?}", raw))),
            },
        },
        TargetType::Bigint => match raw {
            RawValue::Int(v) => Ok(Value::Int(*v)),
            RawValue::UInt(v) => i64::try_from(*v)
                .map(Value::Int)
                .map_err(|_| invalid(format!("{} overflows bigint", v))),
            _ => text_of(raw)
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Value::Int)
                .ok_or_else(|| invalid(format!("{:?}", raw))),
        },
        TargetType::Double => match raw {
            RawValue::Float(v) => Ok(Value::Float(f64::from(*v))),
            RawValue::Double(v) => Ok(Value::Float(*v)),
            RawValue::Int(v) => Ok(Value::Float(*v as f64)),
            RawValue::UInt(v) => Ok(Value::Float(*v as f64)),
            _ => text_of(raw)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(Value::Float)
                .ok_or_else(|| invalid(format!("{:?}", raw))),
        },
        TargetType::Numeric => match raw {
            RawValue::Int(v) => Ok(Value::Numeric(Decimal::from(*v))),
            RawValue::UInt(v) => Ok(Value::Numeric(Decimal::from(*v))),
            RawValue::Double(v) => Decimal::try_from(*v)
                .map(Value::Numeric)
                .map_err(|e| invalid(e.to_string())),
            RawValue::Float(v) => Decimal::try_from(*v)
                .map(Value::Numeric)
                .map_err(|e| invalid(e.to_string())),
            _ => text_of(raw)
                .and_then(|s| Decimal::from_str(s.trim()).ok())
                .map(Value::Numeric)
                .ok_or_else(|| invalid(format!("{:?}", raw))),
        },
        TargetType::Text => match raw {
            RawValue::Bytes(bytes) => String::from_utf8(bytes.clone())
                .map(Value::Text)
                .map_err(|_| invalid("not valid UTF-8".to_string())),
            RawValue::Int(v) => Ok(Value::Text(v.to_string())),
            RawValue::UInt(v) => Ok(Value::Text(v.to_string())),
            RawValue::Float(v) => Ok(Value::Text(v.to_string())),
            RawValue::Double(v) => Ok(Value::Text(v.to_string())),
            other => Ok(Value::Text(other.as_sql(true).trim_matches('\'').to_string())),
        },
        TargetType::Bytea => match raw {
            RawValue::Bytes(bytes) => Ok(Value::Bytes(bytes.clone())),
            other => Err(invalid(format!("{:?} is not binary", other))),
        },
        TargetType::Date => match raw {
            RawValue::Date(y, m, d, _, _, _, _) => NaiveDate::from_ymd_opt(i32::from(*y), u32::from(*m), u32::from(*d))
                .map(Value::Date)
                .ok_or_else(|| invalid(format!("{:04}-{:02}-{:02} is not a valid date", y, m, d))),
            _ => text_of(raw)
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .map(Value::Date)
                .ok_or_else(|| invalid(format!("{:?}", raw))),
        },
        TargetType::Time => match raw {
            RawValue::Time(negative, days, h, m, s, us) => {
                if *negative || *days > 0 {
                    return Err(invalid("outside the 24 hour range".to_string()));
                }
                NaiveTime::from_hms_micro_opt(u32::from(*h), u32::from(*m), u32::from(*s), *us)
                    .map(Value::Time)
                    .ok_or_else(|| invalid(format!("{:?}", raw)))
            }
            _ => text_of(raw)
                .and_then(|s| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok())
                .map(Value::Time)
                .ok_or_else(|| invalid(format!("{:?}", raw))),
        },
        TargetType::Timestamp => match raw {
            RawValue::Date(y, mo, d, h, mi, s, us) => {
                NaiveDate::from_ymd_opt(i32::from(*y), u32::from(*mo), u32::from(*d))
                    .and_then(|date| {
                        date.and_hms_micro_opt(u32::from(*h), u32::from(*mi), u32::from(*s), *us)
                    })
                    .map(Value::Timestamp)
                    .ok_or_else(|| invalid(format!("{:?}", raw)))
            }
            _ => text_of(raw)
                .and_then(|s| NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f").ok())
                .map(Value::Timestamp)
                .ok_or_else(|| invalid(format!("{:?}", raw))),
        },
        TargetType::Jsonb => match raw {
            RawValue::Bytes(bytes) => serde_json::from_slice(bytes)
                .map(Value::Json)
                .map_err(|e| invalid(e.to_string())),
            other => Err(invalid(format!("{:?} is not JSON text", other))),
        },
    }
}

fn text_of(raw: &RawValue) -> Option<String> {
    match raw {
        RawValue::Bytes(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
        _ => None,
    }
}
