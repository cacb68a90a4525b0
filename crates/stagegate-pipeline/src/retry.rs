//! Step retry with exponential backoff and a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::step::StepError;

/// Backoff policy for failed steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed): `base × 2^retry`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Total executor invocations allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure {
    /// Cancellation was observed during backoff.
    Cancelled { attempts: u32 },
    /// Every allowed attempt failed, or a non-retryable error stopped early.
    Exhausted { attempts: u32, message: String },
}

/// Run `operation` until it succeeds, retries run out, or `cancel` fires
/// during a backoff sleep.
///
/// Each attempt is raced against `timeout`; an elapsed timeout counts as a
/// retryable failure. The closure receives the 1-based attempt number.
/// Returns the value together with the number of attempts made.
pub async fn run_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<(T, u32), RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match tokio::time::timeout(timeout, operation(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(label, attempt, "Retry succeeded");
                }
                return Ok((value, attempt));
            }
            Ok(Err(e)) => e,
            Err(_) => StepError::retryable(format!("timed out after {timeout:?}")),
        };

        if !error.retryable || attempt >= max_attempts {
            warn!(label, attempt, error = %error, "Step failed, giving up");
            return Err(RetryFailure::Exhausted {
                attempts: attempt,
                message: error.message,
            });
        }

        let delay = policy.delay_for(attempt - 1);
        warn!(
            label,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Step failed, will retry"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(label, attempt, "Cancelled during retry backoff");
                return Err(RetryFailure::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = run_with_retry(&fast_policy(3), Duration::from_secs(1), &CancellationToken::new(), "t", |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StepError::retryable("flaky"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result, Ok(("done", 3)));
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let result: Result<((), u32), _> =
            run_with_retry(&fast_policy(2), Duration::from_secs(1), &CancellationToken::new(), "t", |_| async {
                Err(StepError::retryable("always"))
            })
            .await;
        assert_eq!(
            result,
            Err(RetryFailure::Exhausted {
                attempts: 3,
                message: "always".into()
            })
        );
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let result: Result<((), u32), _> =
            run_with_retry(&fast_policy(5), Duration::from_secs(1), &CancellationToken::new(), "t", |_| async {
                Err(StepError::fatal("bad input"))
            })
            .await;
        assert!(matches!(result, Err(RetryFailure::Exhausted { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let result = run_with_retry(&fast_policy(1), Duration::from_millis(20), &CancellationToken::new(), "t", |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(attempt)
        })
        .await;
        assert_eq!(result, Ok((2, 2)));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<((), u32), _> =
            tokio::time::timeout(Duration::from_secs(5), run_with_retry(&policy, Duration::from_secs(1), &cancel, "t", |_| async {
                Err(StepError::retryable("nope"))
            }))
            .await
            .expect("cancel should interrupt the backoff");
        assert_eq!(result, Err(RetryFailure::Cancelled { attempts: 1 }));
    }
}
