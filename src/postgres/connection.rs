// ABOUTME: PostgreSQL connection helpers for the target database
// ABOUTME: TLS through native-tls with an opt-in policy for self-signed certificates

use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_postgres::Client;

use crate::error::ReplicationError;
use crate::utils::{retry_with_backoff, sanitize_url, RetryPolicy};

static ALLOW_SELF_SIGNED: AtomicBool = AtomicBool::new(false);

/// Set once at startup from the CLI.
pub fn init_tls_policy(allow_self_signed: bool) {
    ALLOW_SELF_SIGNED.store(allow_self_signed, Ordering::Relaxed);
    if allow_self_signed {
        tracing::warn!("TLS certificate verification is disabled for PostgreSQL connections");
    }
}

fn tls_connector() -> Result<MakeTlsConnector, native_tls::Error> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(ALLOW_SELF_SIGNED.load(Ordering::Relaxed))
        .build()?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a connection and drive it on a background task.
///
/// Errors keep their classification so callers inside the replication loop
/// can tell a refused connection from a rejected login.
pub async fn open(url: &str) -> Result<Client, ReplicationError> {
    let connector = tls_connector().map_err(|e| ReplicationError::Connection(e.to_string()))?;
    let (client, connection) = tokio_postgres::connect(url, connector).await?;

    let safe_url = sanitize_url(url);
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection to {} closed with error: {}", safe_url, e);
        }
    });
    Ok(client)
}

pub async fn connect(url: &str) -> Result<Client> {
    open(url)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))
}

/// Connect with the default backoff policy.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), &RetryPolicy::default()).await
}
