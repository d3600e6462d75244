// ABOUTME: Library root for cdc-replicator
// ABOUTME: Exports the replication engine, configuration and target connection helpers

pub mod cdc;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod postgres;
pub mod shutdown;
pub mod table;
pub mod utils;
