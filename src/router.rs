//! Provider routing.
//!
//! Selects the best available provider for a language pair by
//! preference-weighted scoring over the registry, consulting the circuit
//! breaker when one is wired in. Failover on provider errors is the
//! orchestrator's job; the router only picks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::providers::{ProviderKind, ProviderRegistry, ProviderSnapshot, QualityTier};
use crate::resilience::CircuitBreaker;

/// Routing strategy applied as a scoring bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Favor premium-tier output.
    Quality,
    /// Favor local providers (no network round trip).
    Fast,
    /// Favor zero-cost providers.
    Cost,
    /// Blend: local bonus plus a smaller premium bonus.
    Balanced,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub strategy: RoutingStrategy,

    /// Additional local bonus, independent of the strategy.
    pub prefer_local: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::Balanced,
            prefer_local: false,
        }
    }
}

/// Router errors.
#[derive(Error, Debug)]
pub enum RouterError {
    /// No enabled, healthy provider supports the pair at all.
    #[error("no provider available for {source_lang}-{target_lang}")]
    NoProviderAvailable {
        source_lang: String,
        target_lang: String,
    },

    /// Providers exist for the pair but every circuit is open.
    #[error("providers for {source_lang}-{target_lang} are unavailable while circuits recover")]
    CircuitsOpen {
        source_lang: String,
        target_lang: String,
    },
}

/// The provider a selection resolved to, with its score for diagnostics.
#[derive(Clone)]
pub struct Selection {
    pub provider: Arc<dyn crate::providers::TranslationProvider>,
    pub id: String,
    pub score: f64,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("id", &self.id)
            .field("score", &self.score)
            .finish_non_exhaustive()
    }
}

/// Preference-weighted provider router.
pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
    breaker: Option<Arc<CircuitBreaker>>,
    config: RouterConfig,
}

impl ProviderRouter {
    /// Router without breaker gating.
    pub fn new(registry: Arc<ProviderRegistry>, config: RouterConfig) -> Self {
        Self {
            registry,
            breaker: None,
            config,
        }
    }

    /// Router that excludes providers whose circuit is open.
    pub fn with_breaker(
        registry: Arc<ProviderRegistry>,
        config: RouterConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            registry,
            breaker: Some(breaker),
            config,
        }
    }

    /// Select the best provider for a language pair.
    ///
    /// Candidates are filtered by preference, self-health, breaker health,
    /// and language-pair support, then scored. The stable sort keeps
    /// registration order for equal scores, so ties break by who
    /// registered first. Usage accounting is the caller's: the counter is
    /// recorded only when the selection is actually dispatched.
    pub fn select(&self, source: &str, target: &str) -> Result<Selection, RouterError> {
        let eligible: Vec<ProviderSnapshot> = self
            .registry
            .snapshots()
            .into_iter()
            .filter(|snap| snap.enabled)
            .filter(|snap| snap.provider.is_available())
            .filter(|snap| supports_pair(snap, source, target))
            .collect();

        if eligible.is_empty() {
            return Err(RouterError::NoProviderAvailable {
                source_lang: source.to_string(),
                target_lang: target.to_string(),
            });
        }

        let mut candidates: Vec<(f64, ProviderSnapshot)> = eligible
            .into_iter()
            .filter(|snap| {
                self.breaker
                    .as_ref()
                    .map(|b| b.is_available(&snap.info.id))
                    .unwrap_or(true)
            })
            .map(|snap| (self.score(&snap), snap))
            .collect();

        // Stable by construction: snapshots() yields registration order.
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let Some((score, winner)) = candidates.into_iter().next() else {
            return Err(RouterError::CircuitsOpen {
                source_lang: source.to_string(),
                target_lang: target.to_string(),
            });
        };

        tracing::debug!(
            provider = %winner.info.id,
            score,
            source,
            target,
            "selected provider"
        );

        Ok(Selection {
            provider: winner.provider,
            id: winner.info.id,
            score,
        })
    }

    fn score(&self, snap: &ProviderSnapshot) -> f64 {
        let mut score = 100.0;
        let local = snap.info.kind == ProviderKind::Local;
        let premium = snap.info.quality == QualityTier::Premium;
        let free = snap.info.cost_per_unit == 0.0;

        match self.config.strategy {
            RoutingStrategy::Quality => {
                if premium {
                    score += 50.0;
                }
            }
            RoutingStrategy::Fast => {
                if local {
                    score += 50.0;
                }
            }
            RoutingStrategy::Cost => {
                if free {
                    score += 50.0;
                }
            }
            RoutingStrategy::Balanced => {
                if local {
                    score += 40.0;
                }
                if premium {
                    score += 20.0;
                }
            }
        }

        if self.config.prefer_local && local {
            score += 30.0;
        }

        // Load balancing: heavily used providers yield a little.
        score -= (snap.usage as f64 / 100.0).min(10.0);
        score
    }
}

fn supports_pair(snap: &ProviderSnapshot, source: &str, target: &str) -> bool {
    match snap.provider.supported_pairs() {
        // No enumerable list means the provider is universal.
        None => true,
        Some(pairs) => pairs.iter().any(|(s, t)| s == source && t == target),
    }
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("config", &self.config)
            .field("breaker", &self.breaker.is_some())
            .finish()
    }
}
