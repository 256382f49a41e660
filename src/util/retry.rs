//! Retry with timeout and exponential, jittered backoff for the external
//! calls (DB queries, broker orders). Transient failures are retried up to
//! the configured cap; rate-limit responses get a longer schedule.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
    /// Multiplier applied to the schedule when the failure is a rate limit
    /// (broker HTTP 429).
    pub rate_limit_factor: u32,
}

impl RetryPolicy {
    pub fn db(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(200),
            timeout,
            rate_limit_factor: 1,
        }
    }

    pub fn broker(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(500),
            timeout,
            rate_limit_factor: 4,
        }
    }

    /// Backoff before attempt `n` (1-based, n >= 2): base * 2^(n-2) plus up
    /// to 25% jitter.
    fn backoff(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * (1u64 << (attempt.saturating_sub(2)).min(8));
        let exp = exp * u64::from(if rate_limited { self.rate_limit_factor } else { 1 });
        let jitter = rand::rng().random_range(0..=exp / 4);
        Duration::from_millis(exp + jitter)
    }
}

/// Classified failure returned by the operation closure.
#[derive(Debug)]
pub enum Transient {
    /// Retryable (timeout, connection reset, 5xx).
    Retryable(String),
    /// Retryable with the rate-limit schedule (broker 429).
    RateLimited(String),
    /// Not retryable; surfaces immediately.
    Fatal(String),
}

/// Run `op` with per-attempt timeout and backoff between attempts.
/// Returns the last error message when attempts are exhausted.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Transient>>,
{
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            let rate_limited = last_error.contains("rate limited");
            let delay = policy.backoff(attempt, rate_limited);
            tracing::warn!(%label, attempt, ?delay, error = %last_error, "retrying");
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.timeout, op()).await {
            Err(_) => {
                last_error = format!("{label}: timed out after {:?}", policy.timeout);
            }
            Ok(Err(Transient::Retryable(msg))) => {
                last_error = format!("{label}: {msg}");
            }
            Ok(Err(Transient::RateLimited(msg))) => {
                last_error = format!("{label}: rate limited: {msg}");
            }
            Ok(Err(Transient::Fatal(msg))) => {
                return Err(format!("{label}: {msg}"));
            }
            Ok(Ok(value)) => return Ok(value),
        }
    }
    Err(last_error)
}
