//! # lingoflow
//!
//! Resilience and dispatch core for multi-provider translation pipelines.
//!
//! The crate sits between a caller that wants text translated and a set of
//! pluggable backend adapters, and makes the call path robust:
//!
//! - **Circuit breaker** — per-provider failure tracking that bypasses a
//!   backend after repeated failures and probes it again after a recovery
//!   window ([`resilience::CircuitBreaker`]).
//! - **Rate-limit detection** — adaptive per-provider delays learned from
//!   live 429 / `Retry-After` evidence, plus a shared breaker for
//!   account-level quota exhaustion ([`resilience::RateLimitDetector`]).
//! - **Result cache** — LRU with lazy TTL expiry, byte-accounted capacity,
//!   and optional debounced persistence ([`cache::TranslationCache`]).
//! - **Routing** — preference-weighted provider selection over a
//!   registration-ordered registry ([`router::ProviderRouter`]).
//! - **Retry** — exponential backoff with jitter, driven by a classified
//!   error taxonomy ([`resilience::with_retry`], [`error::TranslateError`]).
//! - **Budget** — a sliding-window request and token ceiling on outbound
//!   traffic ([`resilience::SlidingWindowBudget`]).
//!
//! [`DispatchOrchestrator`] composes all of the above into a single
//! `translate` entry point:
//!
//! ```no_run
//! use lingoflow::{DispatchConfig, DispatchOrchestrator, TranslateRequest};
//! # async fn run(provider: std::sync::Arc<dyn lingoflow::TranslationProvider>) {
//! let orchestrator = DispatchOrchestrator::new(DispatchConfig::default());
//! orchestrator.register_provider(provider);
//!
//! let outcome = orchestrator
//!     .translate(TranslateRequest::single("Hello", "en", "fi"))
//!     .await;
//! assert!(outcome.success);
//! # }
//! ```
//!
//! Backend adapters implement [`TranslationProvider`] and live outside this
//! crate; the core never speaks HTTP itself.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod providers;
pub mod resilience;
pub mod router;

pub use cache::{CacheConfig, CacheStats, TranslationCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DispatchConfig;
pub use error::{ErrorCategory, TranslateError};
pub use orchestrator::{
    DispatchOrchestrator, DispatchOrchestratorBuilder, TextPayload, TranslateOutcome,
    TranslateRequest,
};
pub use providers::{
    ProviderError, ProviderInfo, ProviderKind, ProviderRegistry, QualityTier, TranslateOptions,
    Translation, TranslationProvider,
};
pub use resilience::{
    BudgetConfig, CircuitBreaker, CircuitBreakerConfig, CircuitPhase, RateLimitConfig,
    RateLimitDetector, RetryConfig, SlidingWindowBudget,
};
pub use router::{ProviderRouter, RouterConfig, RoutingStrategy};
