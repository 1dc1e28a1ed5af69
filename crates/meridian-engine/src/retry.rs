//! Retrying transient failures.

use std::thread;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::EngineResult;

/// Runs `op` until it succeeds, fails with a non-retryable error or the
/// policy's attempts are used up.
pub(crate) fn with_retry<T>(policy: &RetryPolicy, what: &str, mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                warn!(what, attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "retrying");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
