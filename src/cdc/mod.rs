// ABOUTME: Change-data-capture replication engine for one source table and its target mirror
// ABOUTME: Reader, decoder, batcher, applier and checkpoint store joined by the orchestrator

pub mod applier;
pub mod batcher;
pub mod decoder;
pub mod observe;
pub mod orchestrator;
pub mod reader;
pub mod record;
pub mod state;
pub mod types;
pub mod writer;

pub use applier::TargetApplier;
pub use batcher::{BatcherConfig, Transaction, TransactionBatcher};
pub use decoder::{
    ChangeEvent, ChangeEventDecoder, ColumnValues, Marker, MarkerKind, Operation, RowChange,
    StreamEvent,
};
pub use observe::{build_observe_query, describe_table, discover_partitions, ObserveSource};
pub use orchestrator::{
    Orchestrator, PipelineOutcome, PipelineSettings, PipelineState, PipelineStats,
};
pub use reader::{spawn_reader, CaptureSession, CaptureSource, ChangeStreamReader, ReaderConfig};
pub use record::{Offset, Position, RawRecord, RecordHeader, ResumeOffsets, TxId};
pub use state::{
    Checkpoint, CheckpointStore, FileCheckpointStore, PostgresCheckpointStore, StateFile,
};
pub use types::{TargetType, TypeMap, Value};
pub use writer::{PostgresWriter, TargetWriter};
