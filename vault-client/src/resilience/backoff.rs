//! Retry combinator.
//!
//! Permanent failures get exactly one attempt. Transient failures are retried
//! until the policy's attempt budget is spent, sleeping a full-jitter delay
//! between attempts. The last error is handed back unchanged.

use keyrelay_core::{BackoffPolicy, Classify, ErrorClass};
use std::fmt;
use std::future::Future;

/// Result of a retried operation plus how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T, E> {
    /// Final result
    pub result: Result<T, E>,
    /// Attempts made, at least 1
    pub attempts: u32,
}

/// Run `operation` under `policy`, asking `classify` whether each failure is
/// worth retrying.
///
/// `operation` receives the 1-based attempt number.
pub async fn with_backoff<T, E, C, F, Fut>(
    policy: &BackoffPolicy,
    classify: C,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    C: Fn(&E) -> ErrorClass,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let error = match operation(attempts).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(error) => error,
        };

        if !classify(&error).is_retryable() {
            tracing::debug!("Attempt {} failed permanently: {}", attempts, error);
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }
        if !policy.allows_retry(attempts) {
            tracing::warn!("Giving up after {} attempts: {}", attempts, error);
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.delay(attempts - 1);
        tracing::debug!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempts,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

/// [`with_backoff`] for errors that classify themselves.
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, operation: F) -> RetryOutcome<T, E>
where
    E: Classify + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_backoff(policy, |e: &E| e.class(), operation).await
}
