//! Adaptive rate-limit detection.
//!
//! A second resilience layer, independent of the per-provider circuit
//! breaker, keyed off live HTTP 429 / `Retry-After` evidence. The generic
//! breaker only knows that calls failed; a 429 often carries an
//! authoritative wait hint, so this detector stores per-provider adaptive
//! delays alongside one shared cross-provider breaker that treats
//! sustained failures as an account-level quota signal.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::duration_ms;
use crate::resilience::CircuitPhase;

/// Samples kept per provider.
const HISTORY_CAP: usize = 50;

/// Detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Fallback wait when a rate-limit response carries no usable hint.
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,

    /// Exponential growth factor for the shared breaker's backoff.
    pub backoff_multiplier: f64,

    /// Upper clamp on any adaptive delay.
    #[serde(with = "duration_ms")]
    pub max_adaptive_delay: Duration,

    /// Cumulative failures before the shared breaker opens.
    pub circuit_breaker_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(2000),
            backoff_multiplier: 2.0,
            max_adaptive_delay: Duration::from_secs(300),
            circuit_breaker_threshold: 5,
        }
    }
}

/// What a provider response looked like, from the detector's perspective.
#[derive(Debug, Clone, Default)]
pub struct ResponseSignal {
    /// HTTP status, when the call produced one.
    pub status: Option<u16>,

    /// Explicit rate-limit flag for adapters without HTTP semantics.
    pub is_rate_limit: bool,

    /// Raw `Retry-After` header value.
    pub retry_after: Option<String>,

    /// Raw `X-RateLimit-Reset` (or `-Reset-After`) header value.
    pub rate_limit_reset: Option<String>,
}

impl ResponseSignal {
    /// Signal for a plain success.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Signal for a failure with only a status code.
    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn indicates_rate_limit(&self) -> bool {
        self.is_rate_limit || self.status == Some(429)
    }
}

/// Identifies the request being resolved: an in-flight id from
/// [`RateLimitDetector::start_request`] or a bare provider id.
#[derive(Debug, Clone, Copy)]
pub enum RequestRef<'a> {
    Id(u64),
    Provider(&'a str),
}

impl From<u64> for RequestRef<'static> {
    fn from(id: u64) -> Self {
        RequestRef::Id(id)
    }
}

impl<'a> From<&'a str> for RequestRef<'a> {
    fn from(provider: &'a str) -> Self {
        RequestRef::Provider(provider)
    }
}

/// Outcome recorded in a provider's history ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Success,
    Error,
    RateLimited,
}

/// One history sample.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSample {
    pub at_ms: u64,
    pub outcome: SampleOutcome,
    pub status: Option<u16>,
}

#[derive(Debug, Default)]
struct ProviderLimitState {
    request_count: u64,
    error_count: u64,
    success_count: u64,
    rate_limited: bool,
    adaptive_delay_ms: u64,
    next_allowed_at_ms: u64,
    history: VecDeque<RequestSample>,
}

impl ProviderLimitState {
    fn push_sample(&mut self, sample: RequestSample) {
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }
}

/// Owned view of one provider's adaptive state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderLimitSnapshot {
    pub provider: String,
    pub request_count: u64,
    pub error_count: u64,
    pub success_count: u64,
    pub rate_limited: bool,
    pub adaptive_delay_ms: u64,
    pub next_allowed_at_ms: u64,
    pub history: Vec<RequestSample>,
}

#[derive(Debug)]
struct SharedBreaker {
    phase: CircuitPhase,
    failure_count: u32,
    next_retry_ms: u64,
    probe_in_flight: bool,
}

impl Default for SharedBreaker {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failure_count: 0,
            next_retry_ms: 0,
            probe_in_flight: false,
        }
    }
}

/// Owned view of the shared breaker.
#[derive(Debug, Clone, Serialize)]
pub struct SharedBreakerSnapshot {
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub next_retry_ms: u64,
    pub probe_in_flight: bool,
}

#[derive(Debug, Clone)]
struct InflightRequest {
    provider: String,
    started_at_ms: u64,
}

/// Adaptive rate-limit detector.
pub struct RateLimitDetector {
    providers: RwLock<HashMap<String, ProviderLimitState>>,
    shared: Mutex<SharedBreaker>,
    inflight: Mutex<HashMap<u64, InflightRequest>>,
    next_id: AtomicU64,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimitDetector {
    /// Create a new detector.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            shared: Mutex::new(SharedBreaker::default()),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            clock,
        }
    }

    /// Whether a request to `provider` may go out now.
    ///
    /// The per-provider adaptive delay is evaluated before the shared
    /// breaker: an authoritative `Retry-After` blocks its provider even
    /// when the shared breaker is closed, and vice versa. Half-open admits
    /// exactly one probe via the in-flight guard.
    pub fn check_request_allowed(&self, provider: &str) -> bool {
        let now = self.clock.now_ms();

        if let Some(state) = self.providers.read().get(provider) {
            if now < state.next_allowed_at_ms {
                return false;
            }
        }

        let mut shared = self.shared.lock();
        match shared.phase {
            CircuitPhase::Closed => true,
            CircuitPhase::Open => {
                if now >= shared.next_retry_ms {
                    shared.phase = CircuitPhase::HalfOpen;
                    shared.probe_in_flight = true;
                    tracing::info!(provider = %provider, "shared limiter half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitPhase::HalfOpen => {
                if shared.probe_in_flight {
                    false
                } else {
                    shared.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Register an outgoing request and get an id to resolve it with.
    pub fn start_request(&self, provider: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now_ms();
        self.inflight.lock().insert(
            id,
            InflightRequest {
                provider: provider.to_string(),
                started_at_ms: now,
            },
        );
        self.providers
            .write()
            .entry(provider.to_string())
            .or_default()
            .request_count += 1;
        id
    }

    /// Record a response. A 429 (or explicit flag) is handled as a rate
    /// limit even on this path; anything else is a success.
    pub fn record_response(&self, target: RequestRef<'_>, signal: &ResponseSignal) {
        let Some(provider) = self.resolve(target) else {
            return;
        };
        if signal.indicates_rate_limit() {
            self.on_rate_limited(&provider, signal);
        } else {
            self.on_success(&provider);
        }
    }

    /// Record a failed request.
    pub fn record_error(&self, target: RequestRef<'_>, signal: &ResponseSignal) {
        let Some(provider) = self.resolve(target) else {
            return;
        };
        if signal.indicates_rate_limit() {
            self.on_rate_limited(&provider, signal);
        } else {
            self.on_failure(&provider, signal);
        }
    }

    /// Current adaptive delay for a provider: its stored delay while the
    /// block is in force, 0 once `next_allowed_at` has passed.
    pub fn adaptive_delay(&self, provider: &str) -> u64 {
        let now = self.clock.now_ms();
        self.providers
            .read()
            .get(provider)
            .filter(|state| now < state.next_allowed_at_ms)
            .map(|state| state.adaptive_delay_ms)
            .unwrap_or(0)
    }

    /// Owned view of the shared breaker.
    pub fn breaker_state(&self) -> SharedBreakerSnapshot {
        let shared = self.shared.lock();
        SharedBreakerSnapshot {
            phase: shared.phase,
            failure_count: shared.failure_count,
            next_retry_ms: shared.next_retry_ms,
            probe_in_flight: shared.probe_in_flight,
        }
    }

    /// Owned view of one provider's adaptive state.
    pub fn provider_state(&self, provider: &str) -> Option<ProviderLimitSnapshot> {
        self.providers.read().get(provider).map(|state| ProviderLimitSnapshot {
            provider: provider.to_string(),
            request_count: state.request_count,
            error_count: state.error_count,
            success_count: state.success_count,
            rate_limited: state.rate_limited,
            adaptive_delay_ms: state.adaptive_delay_ms,
            next_allowed_at_ms: state.next_allowed_at_ms,
            history: state.history.iter().cloned().collect(),
        })
    }

    /// Drop all adaptive state.
    pub fn reset(&self) {
        self.providers.write().clear();
        *self.shared.lock() = SharedBreaker::default();
        self.inflight.lock().clear();
    }

    fn resolve(&self, target: RequestRef<'_>) -> Option<String> {
        match target {
            RequestRef::Provider(provider) => Some(provider.to_string()),
            RequestRef::Id(id) => {
                let request = self.inflight.lock().remove(&id);
                if request.is_none() {
                    tracing::debug!(id, "response for unknown in-flight request");
                }
                request.map(|r| r.provider)
            }
        }
    }

    fn on_success(&self, provider: &str) {
        let now = self.clock.now_ms();
        {
            let mut providers = self.providers.write();
            let state = providers.entry(provider.to_string()).or_default();
            state.success_count += 1;
            state.rate_limited = false;
            state.adaptive_delay_ms = 0;
            state.push_sample(RequestSample {
                at_ms: now,
                outcome: SampleOutcome::Success,
                status: None,
            });
        }

        let mut shared = self.shared.lock();
        match shared.phase {
            CircuitPhase::HalfOpen => {
                // Probe succeeded: close fully.
                shared.phase = CircuitPhase::Closed;
                shared.failure_count = 0;
                shared.probe_in_flight = false;
                shared.next_retry_ms = 0;
                tracing::info!(provider = %provider, "shared limiter closed after successful probe");
            }
            CircuitPhase::Closed => {
                // Self-healing: each success forgives one failure.
                shared.failure_count = shared.failure_count.saturating_sub(1);
            }
            CircuitPhase::Open => {}
        }
    }

    fn on_failure(&self, provider: &str, signal: &ResponseSignal) {
        let now = self.clock.now_ms();
        {
            let mut providers = self.providers.write();
            let state = providers.entry(provider.to_string()).or_default();
            state.error_count += 1;
            state.push_sample(RequestSample {
                at_ms: now,
                outcome: SampleOutcome::Error,
                status: signal.status,
            });
        }
        self.shared_failure(provider, now, None);
    }

    fn on_rate_limited(&self, provider: &str, signal: &ResponseSignal) {
        let now = self.clock.now_ms();
        let hinted = self.wait_hint(signal, now);
        let delay = hinted
            .unwrap_or_else(|| {
                (self.config.base_backoff.as_millis() as f64 * self.config.backoff_multiplier)
                    as u64
            })
            .min(self.config.max_adaptive_delay.as_millis() as u64);

        {
            let mut providers = self.providers.write();
            let state = providers.entry(provider.to_string()).or_default();
            state.error_count += 1;
            state.rate_limited = true;
            state.adaptive_delay_ms = delay;
            state.next_allowed_at_ms = now + delay;
            state.push_sample(RequestSample {
                at_ms: now,
                outcome: SampleOutcome::RateLimited,
                status: signal.status.or(Some(429)),
            });
        }

        tracing::warn!(
            provider = %provider,
            delay_ms = delay,
            hinted = hinted.is_some(),
            "rate limit detected, deferring provider"
        );

        self.shared_failure(provider, now, hinted);
    }

    /// Count a failure against the shared breaker, opening it when the
    /// threshold is reached. Backoff prefers the provider's hinted delay,
    /// else grows exponentially with the failure excess.
    fn shared_failure(&self, provider: &str, now: u64, suggested_ms: Option<u64>) {
        let base = self.config.base_backoff.as_millis() as u64;
        let max = self.config.max_adaptive_delay.as_millis() as u64;

        let mut shared = self.shared.lock();
        shared.failure_count += 1;

        let failed_probe = shared.phase == CircuitPhase::HalfOpen;
        let at_threshold = shared.failure_count >= self.config.circuit_breaker_threshold;
        if !failed_probe && !at_threshold {
            return;
        }

        let excess = shared
            .failure_count
            .saturating_sub(self.config.circuit_breaker_threshold);
        let grown = (self.config.base_backoff.as_millis() as f64
            * self.config.backoff_multiplier.powi(excess as i32 + 1)) as u64;
        let backoff = base.max(suggested_ms.unwrap_or(grown).min(max));

        shared.phase = CircuitPhase::Open;
        shared.probe_in_flight = false;
        shared.next_retry_ms = now + backoff;
        tracing::warn!(
            provider = %provider,
            failures = shared.failure_count,
            backoff_ms = backoff,
            reopened = failed_probe,
            "shared limiter opened"
        );
    }

    /// Extract a wait duration (ms) from response headers.
    ///
    /// Numeric values with at most 10 digits are seconds, longer ones are
    /// milliseconds; values in the epoch range are absolute reset times and
    /// become deltas from `now`. Non-numeric values parse as HTTP-dates
    /// (RFC 2822, then RFC 3339).
    fn wait_hint(&self, signal: &ResponseSignal, now: u64) -> Option<u64> {
        let raw = signal
            .retry_after
            .as_deref()
            .or(signal.rate_limit_reset.as_deref())?;
        let hint = parse_wait_value(raw.trim(), now)?;
        Some(hint.min(self.config.max_adaptive_delay.as_millis() as u64))
    }
}

fn parse_wait_value(raw: &str, now_ms: u64) -> Option<u64> {
    if raw.is_empty() {
        return None;
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        let value: u64 = raw.parse().ok()?;
        let ms = if raw.len() <= 10 { value * 1000 } else { value };
        // Values in the plausible epoch range are absolute reset times;
        // anything smaller is a relative delta.
        return Some(if ms >= 1_000_000_000_000 {
            ms.saturating_sub(now_ms)
        } else {
            ms
        });
    }

    let target_ms = chrono::DateTime::parse_from_rfc2822(raw)
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(raw))
        .ok()?
        .timestamp_millis();
    if target_ms <= 0 {
        return None;
    }
    Some((target_ms as u64).saturating_sub(now_ms))
}

impl std::fmt::Debug for RateLimitDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitDetector")
            .field("config", &self.config)
            .field("tracked", &self.providers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn detector(clock: Arc<ManualClock>) -> RateLimitDetector {
        RateLimitDetector::new(RateLimitConfig::default(), clock)
    }

    fn rate_limited(retry_after: &str) -> ResponseSignal {
        ResponseSignal {
            status: Some(429),
            retry_after: Some(retry_after.to_string()),
            ..ResponseSignal::default()
        }
    }

    #[test]
    fn test_retry_after_seconds_blocks_until_deadline() {
        let clock = Arc::new(ManualClock::new(10_000));
        let detector = detector(Arc::clone(&clock));

        assert!(detector.check_request_allowed("p"));
        detector.record_error(RequestRef::Provider("p"), &rate_limited("20"));

        let state = detector.provider_state("p").unwrap();
        assert_eq!(state.next_allowed_at_ms, 30_000);
        assert_eq!(detector.adaptive_delay("p"), 20_000);

        clock.set(29_999);
        assert!(!detector.check_request_allowed("p"));
        clock.set(30_000);
        assert!(detector.check_request_allowed("p"));
        assert_eq!(detector.adaptive_delay("p"), 0);
    }

    #[test]
    fn test_millisecond_and_epoch_hints() {
        // 12000000000000 ms epoch > now → absolute, becomes a delta.
        assert_eq!(parse_wait_value("12000000000000", 11_999_999_990_000), Some(10_000));
        // 11-digit numeric → milliseconds, relative.
        assert_eq!(parse_wait_value("30000000000", 50_000_000_000_000), Some(30_000_000_000));
        // 2-digit numeric → seconds.
        assert_eq!(parse_wait_value("20", 1_000_000_000_000_000), Some(20_000));
    }

    #[test]
    fn test_http_date_hint() {
        // now = 2015-10-21 07:27:00 UTC, Retry-After to 07:28:00.
        let now_ms = chrono::DateTime::parse_from_rfc3339("2015-10-21T07:27:00Z")
            .unwrap()
            .timestamp_millis() as u64;
        let parsed = parse_wait_value("Wed, 21 Oct 2015 07:28:00 GMT", now_ms);
        assert_eq!(parsed, Some(60_000));
    }

    #[test]
    fn test_missing_hint_uses_backoff_product() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        detector.record_error(
            RequestRef::Provider("p"),
            &ResponseSignal {
                is_rate_limit: true,
                ..ResponseSignal::default()
            },
        );

        // base_backoff 2000 * multiplier 2.0 = 4000.
        assert_eq!(detector.adaptive_delay("p"), 4000);
    }

    #[test]
    fn test_shared_breaker_opens_and_blocks_other_providers() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        for _ in 0..5 {
            detector.record_error(RequestRef::Provider("a"), &ResponseSignal::status(500));
        }

        let state = detector.breaker_state();
        assert_eq!(state.phase, CircuitPhase::Open);
        // Cross-provider by design: b is gated by a's failures.
        assert!(!detector.check_request_allowed("b"));
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        for _ in 0..5 {
            detector.record_error(RequestRef::Provider("a"), &ResponseSignal::status(500));
        }
        let retry_at = detector.breaker_state().next_retry_ms;
        clock.set(retry_at);

        assert!(detector.check_request_allowed("a"));
        // Second caller is held back while the probe is in flight.
        assert!(!detector.check_request_allowed("a"));

        detector.record_response(RequestRef::Provider("a"), &ResponseSignal::ok());
        let state = detector.breaker_state();
        assert_eq!(state.phase, CircuitPhase::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(detector.check_request_allowed("a"));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        for _ in 0..5 {
            detector.record_error(RequestRef::Provider("a"), &ResponseSignal::status(500));
        }
        clock.set(detector.breaker_state().next_retry_ms);
        assert!(detector.check_request_allowed("a"));

        detector.record_error(RequestRef::Provider("a"), &ResponseSignal::status(500));
        let state = detector.breaker_state();
        assert_eq!(state.phase, CircuitPhase::Open);
        assert!(!state.probe_in_flight);
        assert!(!detector.check_request_allowed("a"));
    }

    #[test]
    fn test_closed_successes_self_heal() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        for _ in 0..4 {
            detector.record_error(RequestRef::Provider("a"), &ResponseSignal::status(500));
        }
        assert_eq!(detector.breaker_state().failure_count, 4);

        detector.record_response(RequestRef::Provider("a"), &ResponseSignal::ok());
        detector.record_response(RequestRef::Provider("a"), &ResponseSignal::ok());
        assert_eq!(detector.breaker_state().failure_count, 2);

        // Floor at zero.
        for _ in 0..5 {
            detector.record_response(RequestRef::Provider("a"), &ResponseSignal::ok());
        }
        assert_eq!(detector.breaker_state().failure_count, 0);
    }

    #[test]
    fn test_inflight_id_resolves_to_provider() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        let id = detector.start_request("p");
        detector.record_response(RequestRef::Id(id), &ResponseSignal::ok());

        let state = detector.provider_state("p").unwrap();
        assert_eq!(state.request_count, 1);
        assert_eq!(state.success_count, 1);

        // Resolving the same id twice is a no-op.
        detector.record_response(RequestRef::Id(id), &ResponseSignal::ok());
        assert_eq!(detector.provider_state("p").unwrap().success_count, 1);
    }

    #[test]
    fn test_history_ring_is_capped() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        for _ in 0..(HISTORY_CAP + 10) {
            detector.record_response(RequestRef::Provider("p"), &ResponseSignal::ok());
        }
        let state = detector.provider_state("p").unwrap();
        assert_eq!(state.history.len(), HISTORY_CAP);
        assert_eq!(state.success_count, (HISTORY_CAP + 10) as u64);
    }

    #[test]
    fn test_provider_delay_checked_before_shared_breaker() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = detector(Arc::clone(&clock));

        detector.record_error(RequestRef::Provider("p"), &rate_limited("60"));
        // Shared breaker is still closed (one failure), but the provider's
        // own deadline blocks it.
        assert_eq!(detector.breaker_state().phase, CircuitPhase::Closed);
        assert!(!detector.check_request_allowed("p"));
        assert!(detector.check_request_allowed("other"));
    }
}
