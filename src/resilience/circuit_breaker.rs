//! Circuit breaker to prevent cascade failures.
//!
//! Each provider has its own circuit, created lazily on first use. When
//! calls to a provider fail repeatedly the circuit opens and the router
//! stops offering that provider until the recovery timeout admits a probe.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::duration_ms;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a probe.
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Phase of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Normal operation.
    Closed,
    /// Provider is being bypassed.
    Open,
    /// Recovery timeout elapsed; one probe request is being trialed.
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitEntry {
    phase: CircuitPhase,
    consecutive_failures: u32,
    last_failure_ms: Option<u64>,
    last_probe_ms: Option<u64>,
}

impl CircuitEntry {
    fn closed() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            last_failure_ms: None,
            last_probe_ms: None,
        }
    }
}

/// Owned copy of one circuit's state.
///
/// Mutating a snapshot never touches the breaker's internal state.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub last_failure_ms: Option<u64>,
    pub last_probe_ms: Option<u64>,
}

/// Per-provider circuit breaker.
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, CircuitEntry>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Whether requests may currently reach the provider.
    ///
    /// An open circuit whose recovery timeout has elapsed transitions to
    /// half-open here, stamping the probe time. Half-open keeps answering
    /// true until a result is recorded; callers are expected to send one
    /// probe and report its outcome.
    pub fn is_available(&self, provider: &str) -> bool {
        let now = self.clock.now_ms();
        let mut states = self.states.write();
        let Some(entry) = states.get_mut(provider) else {
            // Unknown provider: closed, available.
            return true;
        };

        match entry.phase {
            CircuitPhase::Closed | CircuitPhase::HalfOpen => true,
            CircuitPhase::Open => {
                let last_failure = entry.last_failure_ms.unwrap_or(0);
                let recovery = self.config.recovery_timeout.as_millis() as u64;
                if now.saturating_sub(last_failure) >= recovery {
                    entry.phase = CircuitPhase::HalfOpen;
                    entry.last_probe_ms = Some(now);
                    tracing::info!(provider = %provider, "circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Closes the circuit and resets the failure count from any phase.
    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.write();
        let entry = states
            .entry(provider.to_string())
            .or_insert_with(CircuitEntry::closed);
        if entry.phase != CircuitPhase::Closed {
            tracing::info!(provider = %provider, "circuit closed after successful recovery");
        }
        entry.phase = CircuitPhase::Closed;
        entry.consecutive_failures = 0;
    }

    /// Record a failed call.
    ///
    /// In half-open a single failed probe reopens immediately, bypassing
    /// the threshold.
    pub fn record_failure(&self, provider: &str) {
        let now = self.clock.now_ms();
        let mut states = self.states.write();
        let entry = states
            .entry(provider.to_string())
            .or_insert_with(CircuitEntry::closed);

        entry.consecutive_failures += 1;
        entry.last_failure_ms = Some(now);

        match entry.phase {
            CircuitPhase::HalfOpen => {
                entry.phase = CircuitPhase::Open;
                tracing::warn!(provider = %provider, "circuit reopened after failed probe");
            }
            CircuitPhase::Closed => {
                if entry.consecutive_failures >= self.config.failure_threshold {
                    entry.phase = CircuitPhase::Open;
                    tracing::warn!(
                        provider = %provider,
                        failures = entry.consecutive_failures,
                        "circuit opened after repeated failures"
                    );
                }
            }
            CircuitPhase::Open => {}
        }
    }

    /// Owned state copy for one provider.
    pub fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        let states = self.states.read();
        let entry = states.get(provider).cloned().unwrap_or_else(CircuitEntry::closed);
        CircuitSnapshot {
            provider: provider.to_string(),
            phase: entry.phase,
            consecutive_failures: entry.consecutive_failures,
            last_failure_ms: entry.last_failure_ms,
            last_probe_ms: entry.last_probe_ms,
        }
    }

    /// Owned state copies for every tracked provider.
    pub fn summary(&self) -> Vec<CircuitSnapshot> {
        self.states
            .read()
            .iter()
            .map(|(provider, entry)| CircuitSnapshot {
                provider: provider.clone(),
                phase: entry.phase,
                consecutive_failures: entry.consecutive_failures,
                last_failure_ms: entry.last_failure_ms,
                last_probe_ms: entry.last_probe_ms,
            })
            .collect()
    }

    /// Reset one provider's circuit to closed.
    pub fn reset(&self, provider: &str) {
        self.states.write().remove(provider);
    }

    /// Reset every circuit to closed.
    pub fn reset_all(&self) {
        self.states.write().clear();
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("tracked", &self.states.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default(), clock)
    }

    #[test]
    fn test_unknown_provider_is_closed_and_available() {
        let cb = breaker(Arc::new(ManualClock::new(0)));
        assert!(cb.is_available("never-seen"));

        let snapshot = cb.snapshot("never-seen");
        assert_eq!(snapshot.phase, CircuitPhase::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let clock = Arc::new(ManualClock::new(1000));
        let cb = breaker(Arc::clone(&clock));

        for _ in 0..4 {
            cb.record_failure("p");
            assert!(cb.is_available("p"));
        }
        cb.record_failure("p");
        assert!(!cb.is_available("p"));
        assert_eq!(cb.snapshot("p").phase, CircuitPhase::Open);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(Arc::new(ManualClock::new(0)));

        cb.record_failure("p");
        cb.record_failure("p");
        cb.record_success("p");
        assert_eq!(cb.snapshot("p").consecutive_failures, 0);

        // Needs a full threshold again to open.
        for _ in 0..4 {
            cb.record_failure("p");
        }
        assert!(cb.is_available("p"));
    }

    #[test]
    fn test_recovery_window_and_probe_success() {
        // Scenario: 5 failures at t=1000, closed again via a probe at t=31000.
        let clock = Arc::new(ManualClock::new(1000));
        let cb = breaker(Arc::clone(&clock));

        for _ in 0..5 {
            cb.record_failure("p");
        }

        clock.set(30_999);
        assert!(!cb.is_available("p"));

        clock.set(31_000);
        assert!(cb.is_available("p"));
        let snapshot = cb.snapshot("p");
        assert_eq!(snapshot.phase, CircuitPhase::HalfOpen);
        assert_eq!(snapshot.last_probe_ms, Some(31_000));

        cb.record_success("p");
        let snapshot = cb.snapshot("p");
        assert_eq!(snapshot.phase, CircuitPhase::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn test_failed_probe_reopens_immediately() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(Arc::clone(&clock));

        for _ in 0..5 {
            cb.record_failure("p");
        }
        clock.advance(30_000);
        assert!(cb.is_available("p"));

        // One failure in half-open reopens without a new threshold.
        cb.record_failure("p");
        assert_eq!(cb.snapshot("p").phase, CircuitPhase::Open);
        assert!(!cb.is_available("p"));
    }

    #[test]
    fn test_providers_are_independent() {
        let cb = breaker(Arc::new(ManualClock::new(0)));

        for _ in 0..5 {
            cb.record_failure("a");
        }
        assert!(!cb.is_available("a"));
        assert!(cb.is_available("b"));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let cb = breaker(Arc::new(ManualClock::new(0)));
        cb.record_failure("p");

        let mut snapshot = cb.snapshot("p");
        snapshot.consecutive_failures = 99;
        snapshot.phase = CircuitPhase::Open;

        assert_eq!(cb.snapshot("p").consecutive_failures, 1);
        assert_eq!(cb.snapshot("p").phase, CircuitPhase::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = breaker(Arc::new(ManualClock::new(0)));
        for _ in 0..5 {
            cb.record_failure("a");
            cb.record_failure("b");
        }
        cb.reset("a");
        assert!(cb.is_available("a"));
        assert!(!cb.is_available("b"));

        cb.reset_all();
        assert!(cb.is_available("b"));
        assert!(cb.summary().is_empty());
    }
}
