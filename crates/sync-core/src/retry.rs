//! Retry with exponential backoff for remote calls.

use crate::error::{Result, SyncError};
use crate::settings::RetryPolicy;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before retry number `attempt` (1-based).
///
/// `initial_delay * backoff_factor^(attempt - 1)`, capped at `max_delay`.
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let factor = u64::from(policy.backoff_factor.max(1));
    let exponent = attempt.saturating_sub(1).min(32);
    let multiplier = factor.saturating_pow(exponent);
    let delay_ms = policy.initial_delay_ms.saturating_mul(multiplier);
    Duration::from_millis(delay_ms.min(policy.max_delay_ms))
}

/// Server errors, rate limiting and the policy's application codes.
pub fn is_transient(err: &SyncError, policy: &RetryPolicy) -> bool {
    match err {
        SyncError::RequestFailed { status, .. } => *status == 429 || (500..600).contains(status),
        SyncError::ApplicationError { code, .. } => policy.retryable_codes.contains(code),
        _ => false,
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects, or
/// `policy.max_attempts` attempts have been made.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&SyncError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let delay = calculate_backoff(attempt, policy);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(operation = label, attempt, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}

/// [`retry_with_backoff`] with the default transient-error predicate.
pub async fn retry_remote<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff(policy, label, |e| is_transient(e, policy), op).await
}
