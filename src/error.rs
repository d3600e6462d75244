// ABOUTME: Error taxonomy for the replication core
// ABOUTME: Every error carries a class that drives the retry-or-halt decision

use std::time::Duration;
use thiserror::Error;

/// How the orchestrator must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity loss, lock contention, timeouts. Retried with backoff.
    Transient,
    /// The shape of the data no longer matches what the pipeline expects. Halts.
    Structural,
    /// Source and target have diverged. Halts and needs manual reconciliation.
    Consistency,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Structural => "structural",
            ErrorClass::Consistency => "consistency",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to turn a raw capture record into a typed change event.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("column `{column}` has source type `{source_type}` with no target type mapping")]
    UnmappedType { column: String, source_type: String },

    #[error("column `{column}` value cannot be converted to {target_type}: {reason}")]
    InvalidValue {
        column: String,
        target_type: &'static str,
        reason: String,
    },

    #[error("unknown change record type `{0}`")]
    UnknownRecordType(String),

    #[error("malformed change record: {0}")]
    MalformedRecord(String),

    #[error("row image is missing key column `{0}`")]
    MissingKeyColumn(String),
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out after {timeout:?} while {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("target lock contention: {0}")]
    LockContention(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("transaction {tx_id} exceeded the limit of {limit} buffered rows")]
    OversizedTransaction { tx_id: String, limit: usize },

    #[error("no row in {table} matches key {key}")]
    RowNotFound { table: String, key: String },

    #[error("source query failed: {0}")]
    Source(String),

    #[error("target statement failed: {0}")]
    Target(String),

    #[error("checkpoint storage failed: {0}")]
    CheckpointIo(String),

    #[error("checkpoint is unreadable: {0}")]
    CheckpointCorrupt(String),

    #[error("checkpoint for partition {partition} would move backwards from {current} to {requested}")]
    CheckpointRegression {
        partition: u32,
        current: String,
        requested: String,
    },
}

impl ReplicationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReplicationError::Connection(_)
            | ReplicationError::Timeout { .. }
            | ReplicationError::LockContention(_)
            | ReplicationError::CheckpointIo(_) => ErrorClass::Transient,
            ReplicationError::SchemaMismatch(_)
            | ReplicationError::Decode(_)
            | ReplicationError::OversizedTransaction { .. }
            | ReplicationError::Source(_)
            | ReplicationError::Target(_)
            | ReplicationError::CheckpointCorrupt(_)
            | ReplicationError::CheckpointRegression { .. } => ErrorClass::Structural,
            ReplicationError::RowNotFound { .. } => ErrorClass::Consistency,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short machine-friendly name used in halt reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationError::Connection(_) => "ConnectionError",
            ReplicationError::Timeout { .. } => "Timeout",
            ReplicationError::LockContention(_) => "LockContention",
            ReplicationError::SchemaMismatch(_) => "SchemaMismatch",
            ReplicationError::Decode(_) => "DecodeError",
            ReplicationError::OversizedTransaction { .. } => "OversizedTransaction",
            ReplicationError::RowNotFound { .. } => "RowNotFound",
            ReplicationError::Source(_) => "SourceError",
            ReplicationError::Target(_) => "TargetError",
            ReplicationError::CheckpointIo(_) => "CheckpointIo",
            ReplicationError::CheckpointCorrupt(_) => "CheckpointCorrupt",
            ReplicationError::CheckpointRegression { .. } => "CheckpointRegression",
        }
    }
}

impl From<tokio_postgres::Error> for ReplicationError {
    fn from(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        if err.is_closed() {
            return ReplicationError::Connection(err.to_string());
        }
        match err.code() {
            Some(code)
                if *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::LOCK_NOT_AVAILABLE
                    || *code == SqlState::QUERY_CANCELED =>
            {
                ReplicationError::LockContention(err.to_string())
            }
            Some(code)
                if *code == SqlState::ADMIN_SHUTDOWN
                    || *code == SqlState::CANNOT_CONNECT_NOW
                    || *code == SqlState::CONNECTION_FAILURE =>
            {
                ReplicationError::Connection(err.to_string())
            }
            Some(_) => ReplicationError::Target(err.to_string()),
            // No SQLSTATE means the failure happened below the protocol (I/O, TLS).
            None => ReplicationError::Connection(err.to_string()),
        }
    }
}

/// MySQL server error codes that mean the observe session was cut off rather
/// than rejected.
const LOST_CONNECTION_CODES: &[u16] = &[
    1053, // server shutdown in progress
    1152, // aborted connection
    1317, // query execution was interrupted
    1927, // connection was killed
    2006, // server has gone away
    2013, // lost connection to server during query
];

impl From<mysql_async::Error> for ReplicationError {
    fn from(err: mysql_async::Error) -> Self {
        match &err {
            mysql_async::Error::Server(server) if LOST_CONNECTION_CODES.contains(&server.code) => {
                ReplicationError::Connection(err.to_string())
            }
            mysql_async::Error::Server(_) => ReplicationError::Source(err.to_string()),
            _ => ReplicationError::Connection(err.to_string()),
        }
    }
}
