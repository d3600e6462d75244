// ABOUTME: Builds one replication pipeline from configuration and runs it
// ABOUTME: Connects the source, resolves the column set, prepares the target and checkpoint store

use anyhow::{Context, Result};

use crate::cdc::decoder::ChangeEventDecoder;
use crate::cdc::observe::{describe_table, ObserveSource};
use crate::cdc::orchestrator::{Orchestrator, PipelineOutcome, PipelineSettings};
use crate::cdc::reader::ReaderConfig;
use crate::cdc::state::{CheckpointStore, PostgresCheckpointStore, StateFile};
use crate::cdc::types::TypeMap;
use crate::cdc::writer::{create_table_sql, PostgresWriter};
use crate::cdc::TargetApplier;
use crate::config::{CheckpointBackend, PipelineConfig, ReplicatorConfig};
use crate::error::ReplicationError;
use crate::shutdown::ShutdownSignal;
use crate::table::TableDefinition;
use crate::utils::sanitize_url;

/// Connection strings for the source and target databases.
#[derive(Clone)]
pub struct Endpoints {
    pub source_url: String,
    pub target_url: String,
}

impl std::fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoints")
            .field("source_url", &sanitize_url(&self.source_url))
            .field("target_url", &sanitize_url(&self.target_url))
            .finish()
    }
}

/// Everything resolved about a pipeline before replication starts.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub name: String,
    pub partitions: usize,
    pub table: TableDefinition,
    pub key_columns: Vec<String>,
    /// Statement that creates the mirror table
    pub create_sql: String,
}

/// Connect to the source, resolve the column set and check that every column
/// type maps onto a target type.
pub async fn plan(
    config: &ReplicatorConfig,
    pipeline: &PipelineConfig,
    endpoints: &Endpoints,
) -> Result<(ObserveSource, PipelinePlan)> {
    let source = ObserveSource::connect(
        &endpoints.source_url,
        &pipeline.source_db,
        &pipeline.source_table,
        pipeline.pipeline.queue_capacity,
    )
    .await?;

    let table = resolve_table(&source, pipeline).await?;
    table
        .verify()
        .map_err(ReplicationError::SchemaMismatch)
        .with_context(|| format!("Table {} cannot be replicated", pipeline.source_key()))?;

    let type_map = config.type_map();
    let decoder = ChangeEventDecoder::new(&table, &type_map);
    decoder
        .validate()
        .map_err(ReplicationError::from)
        .with_context(|| format!("Table {} has an unmapped column type", pipeline.source_key()))?;

    let create_sql = create_table_sql(
        &pipeline.target_schema,
        &pipeline.target_table,
        &table,
        &type_map,
    )
    .map_err(ReplicationError::from)?;

    let plan = PipelinePlan {
        name: pipeline.name(),
        partitions: source.partitions(),
        key_columns: decoder.key_columns(),
        table,
        create_sql,
    };
    Ok((source, plan))
}

async fn resolve_table(source: &ObserveSource, pipeline: &PipelineConfig) -> Result<TableDefinition> {
    if let Some(table) = pipeline.table_definition() {
        tracing::debug!(
            "Using {} declared columns for {}",
            table.columns.len(),
            pipeline.source_key()
        );
        return Ok(table);
    }

    let mut conn = source
        .pool()
        .get_conn()
        .await
        .context("Failed to connect to source for table discovery")?;
    let table = describe_table(&mut conn, &pipeline.source_db, &pipeline.source_table)
        .await
        .with_context(|| format!("Failed to read columns of {}", pipeline.source_key()))?;
    tracing::info!(
        "Discovered {} columns for {}",
        table.columns.len(),
        pipeline.source_key()
    );
    Ok(table)
}

/// Orchestrator settings for `pipeline` reading `table`.
pub fn settings(config: &ReplicatorConfig, pipeline: &PipelineConfig, table: &TableDefinition) -> PipelineSettings {
    PipelineSettings {
        name: pipeline.name(),
        reader: ReaderConfig {
            expected_columns: table.column_names(),
            read_timeout: pipeline.pipeline.read_timeout(),
            reconnect: config.reconnect.clone(),
        },
        batcher: pipeline.pipeline.batcher(),
        retry: config.retry.clone(),
        apply_timeout: pipeline.pipeline.apply_timeout(),
        snapshot_apply_timeout: pipeline.pipeline.snapshot_apply_timeout(),
        queue_capacity: pipeline.pipeline.queue_capacity,
        progress_every: pipeline.pipeline.progress_every,
    }
}

/// The checkpoint store configured for `pipeline`. File stores share
/// `state_file` so concurrent pipelines serialise their writes.
pub fn checkpoint_store(
    config: &ReplicatorConfig,
    pipeline: &PipelineConfig,
    endpoints: &Endpoints,
    state_file: &StateFile,
) -> Box<dyn CheckpointStore> {
    match config.checkpoint.backend {
        CheckpointBackend::File => Box::new(state_file.store_for(
            &endpoints.source_url,
            &pipeline.source_key(),
            &pipeline.target_key(),
        )),
        CheckpointBackend::Postgres => Box::new(PostgresCheckpointStore::new(
            &endpoints.target_url,
            &config.checkpoint.schema,
            &pipeline.source_key(),
            &pipeline.target_key(),
        )),
    }
}

/// Run one pipeline until shutdown or a halting error.
///
/// Setup failures (connecting, discovering the table, creating the mirror)
/// are returned as errors; once replication starts every outcome is
/// reported through [`PipelineOutcome`].
pub async fn run(
    config: &ReplicatorConfig,
    pipeline: &PipelineConfig,
    endpoints: &Endpoints,
    state_file: &StateFile,
    shutdown: ShutdownSignal,
) -> Result<PipelineOutcome> {
    let (source, plan) = plan(config, pipeline, endpoints).await?;
    tracing::info!(
        "Pipeline {}: {} partition(s), key ({})",
        plan.name,
        plan.partitions,
        plan.key_columns.join(", ")
    );

    let type_map: TypeMap = config.type_map();
    let client = crate::postgres::connect_with_retry(&endpoints.target_url).await?;
    let mut writer = PostgresWriter::new(
        &endpoints.target_url,
        &pipeline.target_schema,
        &pipeline.target_table,
        plan.key_columns.clone(),
    )
    .with_client(client);
    if pipeline.create_target_table {
        writer
            .ensure_table(&plan.table, &type_map)
            .await
            .with_context(|| format!("Failed to create target table {}", pipeline.target_key()))?;
    }

    let decoder = ChangeEventDecoder::new(&plan.table, &type_map);
    let applier = TargetApplier::new(writer, &pipeline.target_key(), plan.key_columns.clone());
    let store = checkpoint_store(config, pipeline, endpoints, state_file);

    let orchestrator = Orchestrator::new(
        settings(config, pipeline, &plan.table),
        source,
        decoder,
        applier,
        store,
    );
    Ok(orchestrator.run(shutdown).await)
}
