// ABOUTME: Target database access
// ABOUTME: Re-exports the connection helpers

pub mod connection;

pub use connection::{connect, connect_with_retry, open};
