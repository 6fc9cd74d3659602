//! Resilience patterns for the dispatch core.
//!
//! This module provides:
//! - Per-provider circuit breaker to prevent cascade failures
//! - Adaptive rate-limit detection keyed off live 429 evidence
//! - Sliding-window request/token budget
//! - Retry with exponential backoff and jitter

mod budget;
mod circuit_breaker;
mod rate_limit;
mod retry;

pub use budget::{estimate_tokens, BudgetConfig, BudgetUsage, SlidingWindowBudget};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPhase, CircuitSnapshot};
pub use rate_limit::{
    ProviderLimitSnapshot, RateLimitConfig, RateLimitDetector, RequestRef, RequestSample,
    ResponseSignal, SampleOutcome, SharedBreakerSnapshot,
};
pub use retry::{with_default_retry, with_retry, JitterBackoff, RetryConfig};
