use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio::time::timeout;

use crate::BackendError;
use crate::BackoffPolicy;
use crate::Result;
use tracing::warn;

/// Runs `task` under a per-attempt timeout with exponential backoff between
/// attempts. Only retryable errors (connection loss, unavailability,
/// timeouts) are retried; contract errors surface immediately.
///
/// `policy.max_retries == 0` means unlimited attempts.
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    policy: &BackoffPolicy,
    mut task: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempt_budget = Duration::from_millis(policy.timeout_ms);
    let mut delay = Duration::from_millis(policy.base_delay_ms.max(1));
    let max_delay = Duration::from_millis(policy.max_delay_ms.max(1));
    let mut attempt = 0usize;
    let mut last: crate::Error;

    loop {
        attempt += 1;
        match timeout(attempt_budget, task()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => {
                warn!("attempt {} failed: {:?}", attempt, &e);
                last = e;
            }
            Err(_) => {
                warn!("attempt {} timed out after {:?}", attempt, attempt_budget);
                last = BackendError::Timeout(attempt_budget).into();
            }
        }

        if policy.max_retries != 0 && attempt >= policy.max_retries {
            return Err(BackendError::RetryExhausted {
                attempts: attempt,
                last: last.to_string(),
            }
            .into());
        }

        sleep(delay + jitter(policy.base_delay_ms)).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// Random fraction of the base delay, to de-correlate replicas retrying
/// against the same struggling ensemble.
fn jitter(base_delay_ms: u64) -> Duration {
    let cap = (base_delay_ms / 2).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..cap))
}
