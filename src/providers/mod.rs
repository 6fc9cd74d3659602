//! Translation provider abstractions.
//!
//! This module defines the trait every backend adapter implements and the
//! request/response types shared across the core. Concrete adapters (HTTP
//! APIs, local models) live outside this crate; the core only sees this
//! surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod registry;

pub use registry::{ProviderRegistry, ProviderSnapshot};

/// Errors from provider adapters.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Unsupported language pair: {source_lang}-{target_lang}")]
    UnsupportedPair {
        source_lang: String,
        target_lang: String,
    },

    #[error("Provider not ready: {0}")]
    NotReady(String),
}

/// Where a provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// On-device model, no network round trip.
    Local,
    /// Remote API.
    Cloud,
}

/// Output quality tier, used by the router's scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Standard,
    Premium,
}

/// Static description of a provider, fixed at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Stable identifier, also the circuit breaker and cache-key namespace.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Local or cloud.
    pub kind: ProviderKind,

    /// Quality tier.
    pub quality: QualityTier,

    /// Cost per translated unit; 0.0 means free.
    pub cost_per_unit: f64,
}

/// Per-call options passed through to the adapter.
#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    /// Optional per-call timeout override.
    pub timeout: Option<Duration>,

    /// Cooperative abort signal. Once a call is dispatched, cancellation is
    /// honored by the adapter, not enforced by the core.
    pub abort: Option<Arc<AtomicBool>>,
}

/// A single translated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    /// Translated text.
    pub text: String,

    /// Source language the provider detected, if it reported one.
    pub detected_source: Option<String>,
}

/// Backend adapter trait.
///
/// Adapters own the actual model or HTTP call; the core routes to them,
/// gates them behind the breaker and limiter, and caches their results.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// One-time setup (model load, connection warmup).
    async fn initialize(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Cheap self-health check consulted by the router on every selection.
    fn is_available(&self) -> bool {
        true
    }

    /// Supported (source, target) pairs. `None` means the provider accepts
    /// any pair.
    fn supported_pairs(&self) -> Option<Vec<(String, String)>> {
        None
    }

    /// Translate one text.
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
        options: &TranslateOptions,
    ) -> Result<Translation, ProviderError>;

    /// End-to-end smoke test of the adapter.
    async fn test(&self) -> bool {
        self.is_available()
    }

    /// Static provider description.
    fn info(&self) -> ProviderInfo;
}

impl From<ProviderError> for crate::error::TranslateError {
    fn from(err: ProviderError) -> Self {
        use crate::error::{ErrorCategory, TranslateError};
        match err {
            ProviderError::RateLimited { .. } => {
                TranslateError::new(ErrorCategory::RateLimit, err.to_string())
            }
            ProviderError::AuthError => TranslateError::new(ErrorCategory::Auth, err.to_string()),
            ProviderError::Timeout(_) => {
                TranslateError::new(ErrorCategory::Timeout, err.to_string())
            }
            ProviderError::UnsupportedPair { .. } => {
                TranslateError::new(ErrorCategory::Language, err.to_string())
            }
            ProviderError::ApiError { status, message } => {
                TranslateError::from_status(status, message)
            }
            ProviderError::HttpError(message) => TranslateError::classify(message),
            ProviderError::NotReady(message) => {
                TranslateError::new(ErrorCategory::Model, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::error::TranslateError;

    #[test]
    fn test_provider_error_maps_to_taxonomy() {
        let err: TranslateError = ProviderError::RateLimited { retry_after: None }.into();
        assert_eq!(err.category, ErrorCategory::RateLimit);

        let err: TranslateError = ProviderError::AuthError.into();
        assert_eq!(err.category, ErrorCategory::Auth);
        assert!(!err.retryable);

        let err: TranslateError = ProviderError::ApiError {
            status: 503,
            message: "overloaded".to_string(),
        }
        .into();
        assert_eq!(err.category, ErrorCategory::Model);
        assert!(err.retryable);
    }

    #[test]
    fn test_http_error_classified_from_message() {
        let err: TranslateError =
            ProviderError::HttpError("connection reset by peer".to_string()).into();
        assert_eq!(err.category, ErrorCategory::Network);
    }
}
