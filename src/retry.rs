use crate::error::{ErrorKind, Result};
use std::future::Future;
use std::time::Duration;

// ─── Retry policy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt (rate limiting).
    Fixed,
    /// Delay doubles per attempt, capped at `max_delay`.
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }

    /// Default policy for a failure category.
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::RateLimitExceeded => Self {
                max_attempts: 3,
                base_delay: Duration::from_millis(1_000),
                max_delay: Duration::from_secs(30),
                backoff: Backoff::Fixed,
            },
            ErrorKind::ServerError | ErrorKind::ServiceUnavailable | ErrorKind::Timeout => Self {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                backoff: Backoff::Exponential,
            },
            _ => Self::none(),
        }
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = date.signed_duration_since(chrono::Utc::now());
    delta.to_std().ok()
}

// ─── Retry executor ──────────────────────────────────────────────────────────

/// Run `operation` with per-kind retry, sleeping in the calling task.
///
/// The surfaced error is the last failure with its `attempts` count stamped.
/// A server `retry_after` hint overrides the policy delay outright, including
/// the policy's `max_delay` cap; the cap applies only to computed delays.
pub async fn run_with_retry<T, F, Fut>(
    provider: &str,
    max_attempts_override: Option<u32>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(provider, attempt, "provider recovered after retries");
                }
                return Ok(value);
            }
            Err(mut error) => {
                let mut policy = RetryPolicy::for_kind(error.kind);
                if let Some(max) = max_attempts_override {
                    policy.max_attempts = max.max(1);
                }

                if !error.retryable || attempt >= policy.max_attempts {
                    error.attempts = attempt;
                    return Err(error);
                }

                let delay = match error.retry_after {
                    Some(hint) => hint,
                    None => policy.delay_for_attempt(attempt),
                };
                tracing::warn!(
                    provider,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "provider call failed, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
