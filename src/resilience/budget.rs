//! Sliding-window request and token budget.
//!
//! A throughput ceiling independent of the circuit breakers: it bounds
//! what we send, not how the backend behaves. Requests are admitted only
//! while both the request count and the token total inside the window
//! stay under their ceilings.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::duration_ms;

/// Budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Window length.
    #[serde(with = "duration_ms")]
    pub window: Duration,

    /// Maximum requests per window.
    pub max_requests: u32,

    /// Maximum estimated tokens per window.
    pub max_tokens: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 60,
            max_tokens: 100_000,
        }
    }
}

/// Usage inside the current window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BudgetUsage {
    pub requests: u32,
    pub tokens: u32,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at_ms: u64,
    tokens: u32,
}

/// Sliding-window budget tracker.
pub struct SlidingWindowBudget {
    samples: Mutex<VecDeque<Sample>>,
    config: BudgetConfig,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowBudget {
    /// Create a new budget.
    pub fn new(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            config,
            clock,
        }
    }

    /// Admit and record a request costing `tokens`, or reject it.
    ///
    /// Check and record happen under one lock so concurrent callers cannot
    /// both squeeze through the last slot.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let now = self.clock.now_ms();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.config.window);

        let requests = samples.len() as u32;
        let spent: u32 = samples.iter().map(|s| s.tokens).sum();
        if requests + 1 > self.config.max_requests || spent + tokens > self.config.max_tokens {
            tracing::debug!(
                requests,
                spent,
                tokens,
                "budget window exhausted, rejecting request"
            );
            return false;
        }

        samples.push_back(Sample { at_ms: now, tokens });
        true
    }

    /// Usage currently inside the window.
    pub fn usage(&self) -> BudgetUsage {
        let now = self.clock.now_ms();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.config.window);
        BudgetUsage {
            requests: samples.len() as u32,
            tokens: samples.iter().map(|s| s.tokens).sum(),
        }
    }

    /// Drop all recorded usage.
    pub fn reset(&self) {
        self.samples.lock().clear();
    }

    fn prune(samples: &mut VecDeque<Sample>, now: u64, window: Duration) {
        let cutoff = now.saturating_sub(window.as_millis() as u64);
        while samples.front().is_some_and(|s| s.at_ms < cutoff) {
            samples.pop_front();
        }
    }
}

/// Rough token estimate: ~4 characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4).max(1) as u32
}

impl std::fmt::Debug for SlidingWindowBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowBudget")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn budget(clock: Arc<ManualClock>, max_requests: u32, max_tokens: u32) -> SlidingWindowBudget {
        SlidingWindowBudget::new(
            BudgetConfig {
                window: Duration::from_secs(60),
                max_requests,
                max_tokens,
            },
            clock,
        )
    }

    #[test]
    fn test_request_ceiling() {
        let clock = Arc::new(ManualClock::new(0));
        let budget = budget(Arc::clone(&clock), 3, 1000);

        assert!(budget.try_acquire(10));
        assert!(budget.try_acquire(10));
        assert!(budget.try_acquire(10));
        assert!(!budget.try_acquire(10));
        assert_eq!(budget.usage().requests, 3);
    }

    #[test]
    fn test_token_ceiling() {
        let clock = Arc::new(ManualClock::new(0));
        let budget = budget(Arc::clone(&clock), 100, 100);

        assert!(budget.try_acquire(60));
        assert!(!budget.try_acquire(50));
        assert!(budget.try_acquire(40));
        assert_eq!(budget.usage().tokens, 100);
    }

    #[test]
    fn test_window_slides() {
        let clock = Arc::new(ManualClock::new(0));
        let budget = budget(Arc::clone(&clock), 2, 1000);

        assert!(budget.try_acquire(10));
        clock.advance(30_000);
        assert!(budget.try_acquire(10));
        assert!(!budget.try_acquire(10));

        // First sample ages out after 60s.
        clock.advance(31_000);
        assert!(budget.try_acquire(10));
        assert_eq!(budget.usage().requests, 2);
    }

    #[test]
    fn test_reset() {
        let clock = Arc::new(ManualClock::new(0));
        let budget = budget(Arc::clone(&clock), 1, 1000);

        assert!(budget.try_acquire(10));
        assert!(!budget.try_acquire(10));
        budget.reset();
        assert!(budget.try_acquire(10));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("Hello, world"), 3);
        assert_eq!(estimate_tokens("a"), 1);
    }
}
