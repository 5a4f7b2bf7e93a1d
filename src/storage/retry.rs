use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

/// Base delay between persistence attempts; doubles per attempt.
const RETRY_BASE_MS: u64 = 20;

/// Run `op` up to `attempts` times (at least once), returning the last error.
pub async fn with_retry<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    error!(op = what, attempts, error = %e, "persist_retries_exhausted");
                    return Err(e);
                }
                // Exponential backoff with jitter
                let backoff = Duration::from_millis(
                    (1 << (attempt - 1)) * RETRY_BASE_MS + rand::random::<u64>() % RETRY_BASE_MS,
                );
                warn!(op = what, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "persist_retry");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
