//! Aggregate configuration for the dispatch core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::resilience::{BudgetConfig, CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use crate::router::RouterConfig;

/// Serialize durations as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Top-level configuration assembled from the component configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum characters per text item.
    pub max_text_len: usize,

    /// Maximum items per batch request.
    pub max_batch: usize,

    /// Timeout applied to each provider call attempt.
    #[serde(with = "duration_ms")]
    pub provider_timeout: Duration,

    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub budget: BudgetConfig,
    pub router: RouterConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_text_len: 5000,
            max_batch: 50,
            provider_timeout: Duration::from_secs(30),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            budget: BudgetConfig::default(),
            router: RouterConfig::default(),
        }
    }
}
