//! Bounded exponential backoff and deadline polling.
//!
//! Every provider call site goes through one of these helpers so timeout and
//! retry behavior is uniform: a provider-call timeout surfaces as the same
//! retryable error as a network failure.

use crate::error::{MigrateError, MigrateResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry knobs for one class of operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// with up to 25% random jitter to avoid thundering herds.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        capped.mul_f64(1.0 + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 3 attempts: 1s, 2s between them.
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Run `op` until it succeeds, fails fatally, or exhausts the policy.
///
/// Only errors whose [`MigrateError::is_retryable`] is true are retried;
/// anything else propagates immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> MigrateResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MigrateResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff_delay(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(what, attempt, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}

/// Wrap a single provider call with an explicit timeout.
///
/// A timeout is indistinguishable from a network failure to callers: it
/// surfaces as a retryable [`MigrateError::Transient`].
pub async fn with_timeout<T, Fut>(timeout: Duration, what: &str, fut: Fut) -> MigrateResult<T>
where
    Fut: Future<Output = MigrateResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MigrateError::Transient(format!(
            "{} timed out after {:?}",
            what, timeout
        ))),
    }
}

/// Poll `check` every `interval` until it yields `Some`, erroring out when
/// `deadline` elapses. The deadline error is retryable so a stage cap can
/// decide whether to re-enter the poll.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    deadline: Duration,
    what: &str,
    mut check: F,
) -> MigrateResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MigrateResult<Option<T>>>,
{
    let started = tokio::time::Instant::now();
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if started.elapsed() >= deadline {
            return Err(MigrateError::Transient(format!(
                "{} did not complete within {:?}",
                what, deadline
            )));
        }
        tracing::debug!(what, elapsed_ms = started.elapsed().as_millis() as u64, "still pending");
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(4));
        // Jitter adds at most 25%.
        assert!(policy.backoff_delay(1) >= Duration::from_secs(1));
        assert!(policy.backoff_delay(1) <= Duration::from_millis(1250));
        assert!(policy.backoff_delay(2) >= Duration::from_secs(2));
        // Capped at max_delay (+ jitter).
        assert!(policy.backoff_delay(10) <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_transient(&fast_policy(), "test op", move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MigrateError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: MigrateResult<u32> = retry_transient(&fast_policy(), "test op", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MigrateError::Discovery("no such instance".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(MigrateError::Discovery(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let result: MigrateResult<u32> = retry_transient(&fast_policy(), "test op", || async {
            Err(MigrateError::Transient("still down".into()))
        })
        .await;
        assert!(matches!(result, Err(MigrateError::Transient(_))));
    }

    #[tokio::test]
    async fn poll_deadline_is_transient() {
        let result: MigrateResult<u32> = poll_until(
            Duration::from_millis(1),
            Duration::from_millis(5),
            "never ready",
            || async { Ok(None) },
        )
        .await;
        assert!(matches!(result, Err(MigrateError::Transient(_))));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let result: MigrateResult<u32> =
            with_timeout(Duration::from_millis(5), "slow call", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(MigrateError::Transient(_))));
    }
}
