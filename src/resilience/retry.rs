//! Retry with exponential backoff and jitter.
//!
//! [`RetryConfig`] plugs into `backon` as a backoff builder so any
//! fallible async operation can be wrapped with [`with_retry`]. Delays
//! double per attempt, are capped at `max_delay`, jittered uniformly by
//! `jitter_factor`, and never drop below `base_delay`.

use backon::{BackoffBuilder, Retryable};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::config::duration_ms;
use crate::error::TranslateError;

/// Retry policy, passed per call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// First delay and the floor for every jittered delay.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Cap on the exponential delay before jitter.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Uniform jitter as a fraction of the delay, in [0, 1].
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    /// Delay for a given attempt (0-based), before jitter.
    fn exponential_ms(&self, attempt: u32) -> u64 {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        base.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            .min(max)
    }
}

/// Iterator over jittered backoff delays, one per retry.
#[derive(Debug, Clone)]
pub struct JitterBackoff {
    config: RetryConfig,
    attempt: u32,
}

impl Iterator for JitterBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }

        let exponential = self.config.exponential_ms(self.attempt) as f64;
        let spread = exponential * self.config.jitter_factor;
        let jittered = if spread > 0.0 {
            exponential + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            exponential
        };
        let floor = self.config.base_delay.as_millis() as f64;
        let delay_ms = jittered.max(floor);

        self.attempt += 1;
        Some(Duration::from_millis(delay_ms.round() as u64))
    }
}

impl BackoffBuilder for RetryConfig {
    type Backoff = JitterBackoff;

    fn build(self) -> JitterBackoff {
        JitterBackoff {
            config: self,
            attempt: 0,
        }
    }
}

/// Run `operation` with retries governed by `config`.
///
/// `should_retry` decides per classified error whether another attempt is
/// worthwhile; the last error is returned when attempts are exhausted or
/// the predicate declines. The default predicate is
/// `|e| e.retryable` — callers override it to narrow retries (for example
/// "only network errors") or to fold in circuit checks.
pub async fn with_retry<T, F, Fut, P>(
    config: &RetryConfig,
    mut should_retry: P,
    operation: F,
) -> Result<T, TranslateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TranslateError>>,
    P: FnMut(&TranslateError) -> bool,
{
    operation
        .retry(config.clone())
        .when(|err: &TranslateError| should_retry(err))
        .notify(|err, delay| {
            tracing::debug!(
                category = %err.category,
                delay_ms = delay.as_millis() as u64,
                "retrying after error: {}",
                err.message
            );
        })
        .await
}

/// [`with_retry`] with the classified-retryability predicate.
pub async fn with_default_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: F,
) -> Result<T, TranslateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TranslateError>>,
{
    with_retry(config, |err| err.retryable, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, TranslateError};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = with_default_retry(&fast_config(3), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TranslateError::new(ErrorCategory::Network, "connection reset"))
                } else {
                    Ok("translated")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "translated");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), _> = with_default_retry(&fast_config(2), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(TranslateError::new(
                    ErrorCategory::Timeout,
                    format!("attempt {n} timed out"),
                ))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.message.contains("attempt 2"));
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), _> = with_default_retry(&fast_config(5), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TranslateError::new(ErrorCategory::Auth, "bad api key"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().category, ErrorCategory::Auth);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_overrides_default() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        // Only retry network errors; timeout is normally retryable.
        let result: Result<(), _> = with_retry(
            &fast_config(5),
            |err| err.category == ErrorCategory::Network,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TranslateError::new(ErrorCategory::Timeout, "deadline"))
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            jitter_factor: 0.0,
        };
        let delays: Vec<u64> = config
            .clone()
            .build()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 400, 400]);
    }

    proptest! {
        #[test]
        fn prop_delays_stay_within_bounds(
            base in 1u64..5_000,
            max_mult in 1u64..16,
            jitter in 0.0f64..1.0,
            retries in 1u32..8,
        ) {
            let config = RetryConfig {
                max_retries: retries,
                base_delay: Duration::from_millis(base),
                max_delay: Duration::from_millis(base * max_mult),
                jitter_factor: jitter,
            };
            let upper = (base * max_mult) as f64 * (1.0 + jitter);
            for delay in config.clone().build() {
                let ms = delay.as_millis() as u64;
                prop_assert!(ms >= base);
                // One-millisecond slack for rounding.
                prop_assert!((ms as f64) <= upper + 1.0);
            }
        }
    }
}
