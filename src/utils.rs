// ABOUTME: Utility functions shared by the source, target and checkpoint layers
// ABOUTME: Identifier quoting, URL sanitising, hex encoding and retry backoff

use anyhow::Result;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
///
/// `max_attempts` counts retries after the first failure; once a caller has
/// failed `max_attempts + 1` times in a row it must give up.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomly added or removed (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        failures <= self.max_attempts
    }

    /// Base delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay before retry number `attempt` (1-based), with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor)
    }
}

/// Retry a function with exponential backoff
///
/// Executes an async operation with automatic retry on failure. Each retry doubles
/// the delay (exponential backoff) to handle transient failures gracefully.
///
/// Used at startup for connection setup; the replication loop itself routes
/// every failure through the orchestrator instead.
pub async fn retry_with_backoff<F, Fut, T>(mut operation: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if !policy.allows(attempt) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    policy.max_attempts + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Quote a PostgreSQL identifier (schema, table, column)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a MySQL identifier (database, table, column)
///
/// MySQL uses backticks for identifier quoting. Escapes embedded backticks
/// by doubling them.
///
/// # Examples
///
/// ```
/// use cdc_replicator::utils::quote_mysql_ident;
/// assert_eq!(quote_mysql_ident("users"), "`users`");
/// assert_eq!(quote_mysql_ident("user`name"), "`user``name`");
/// ```
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Sanitize a database URL by removing the password component
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}

/// Lowercase hex rendering of raw bytes.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Parse a hex string produced by [`to_hex`].
pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
