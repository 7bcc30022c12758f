use std::future::Future;
use std::time::Duration;

use error_stack::ResultExt;
use rand::Rng;
use tracing::warn;

use crate::adapters::config::{BackoffConfig, RetryConfig};
use crate::ports::ProviderResult;

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// Bounded retries of transient provider failures against the same provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let backoff = match config.backoff {
            BackoffConfig::Fixed { delay_ms } => Backoff::Fixed(Duration::from_millis(delay_ms)),
            BackoffConfig::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => Backoff::Exponential {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms),
                multiplier,
            },
        };
        Self::new(config.max_attempts, backoff).with_jitter(config.jitter)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            jitter: false,
        }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Jitter scales the delay by a random factor in `[0.5, 1.0]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error, or the attempts are
    /// used up. The last error is returned with the attempt count attached. Dropping the returned
    /// future cancels any pending backoff sleep.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(report)
                    if report.current_context().is_transient() && attempt < self.max_attempts =>
                {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        error = %report.current_context(),
                        ?delay,
                        "Transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(report) => {
                    return Err(report).attach_printable(format!("Attempts: {attempt}"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use error_stack::Report;

    use super::*;
    use crate::ports::ProviderError;

    fn exponential() -> Backoff {
        Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = exponential();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(500), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy =
            RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(1_000))).with_jitter(true);
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from(&RetryConfig {
            max_attempts: 0,
            backoff: BackoffConfig::Fixed { delay_ms: 10 },
            jitter: false,
        });
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for(3), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(3, exponential());
        let started = tokio::time::Instant::now();
        let result = policy
            .run(|| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Report::new(ProviderError::Timeout))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Backoff::Fixed(Duration::from_secs(1)));
        let report = policy
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Report::new(ProviderError::RateLimited))
            })
            .await
            .unwrap_err();
        assert_eq!(*report.current_context(), ProviderError::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(5, exponential());
        let report = policy
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Report::new(ProviderError::Malformed))
            })
            .await
            .unwrap_err();
        assert_eq!(*report.current_context(), ProviderError::Malformed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
