//! Error taxonomy and classification.
//!
//! Every failure that crosses a component boundary is normalized into a
//! [`TranslateError`] carrying a category, a retryability flag, and an
//! actionable suggestion. Callers branch on that data instead of matching
//! error types, and the retry executor uses the `retryable` flag as its
//! default predicate.

use lazy_static::lazy_static;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories, checked in declaration order during classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Memory,
    Model,
    Language,
    Timeout,
    Auth,
    RateLimit,
    Input,
    Internal,
}

impl ErrorCategory {
    /// Default retryability for the category.
    ///
    /// Input, auth, and language errors will not change on a retry;
    /// everything transient is retryable by default.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Memory
                | ErrorCategory::Model
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
        )
    }

    /// User-facing suggestion for the category.
    pub fn suggestion(self) -> &'static str {
        match self {
            ErrorCategory::Network => "Check your connection and try again",
            ErrorCategory::Memory => "Close other tabs or reduce the batch size",
            ErrorCategory::Model => "The translation backend is struggling; try again shortly",
            ErrorCategory::Language => "This language pair is not supported by the selected provider",
            ErrorCategory::Timeout => "The request took too long; try a shorter text",
            ErrorCategory::Auth => "Verify the provider API key in settings",
            ErrorCategory::RateLimit => "Provider rate limit reached; wait before retrying",
            ErrorCategory::Input => "Check the input text and language codes",
            ErrorCategory::Internal => "Unexpected error; try again or report it",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Model => "model",
            ErrorCategory::Language => "language",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Input => "input",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A classified dispatch error.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{category}: {message}")]
pub struct TranslateError {
    /// Failure category from the taxonomy.
    pub category: ErrorCategory,

    /// Whether a retry could plausibly succeed.
    pub retryable: bool,

    /// Human-readable description of the failure.
    pub message: String,

    /// Actionable hint for the user.
    pub suggestion: String,
}

lazy_static! {
    // One RegexSet per category, evaluated in taxonomy order; first match wins.
    static ref CATEGORY_RULES: Vec<(ErrorCategory, RegexSet)> = vec![
        (
            ErrorCategory::Network,
            RegexSet::new([
                r"(?i)network",
                r"(?i)fetch",
                r"(?i)connection",
                r"(?i)\boffline\b",
                r"(?i)\bdns\b",
                r"(?i)socket",
                r"(?i)unreachable",
            ])
            .expect("network rules"),
        ),
        (
            ErrorCategory::Memory,
            RegexSet::new([
                r"(?i)out of memory",
                r"(?i)\boom\b",
                r"(?i)allocation",
                r"(?i)memory",
            ])
            .expect("memory rules"),
        ),
        (
            ErrorCategory::Model,
            RegexSet::new([
                r"(?i)model",
                r"(?i)inference",
                r"(?i)checkpoint",
                r"(?i)backend (failed|unavailable)",
                r"(?i)overloaded",
            ])
            .expect("model rules"),
        ),
        (
            ErrorCategory::Language,
            RegexSet::new([
                r"(?i)language",
                r"(?i)unsupported (pair|locale)",
                r"(?i)lang(uage)? code",
            ])
            .expect("language rules"),
        ),
        (
            ErrorCategory::Timeout,
            RegexSet::new([r"(?i)timed? ?out", r"(?i)deadline", r"(?i)timeout"])
                .expect("timeout rules"),
        ),
        (
            ErrorCategory::Auth,
            RegexSet::new([
                r"(?i)unauthori[sz]ed",
                r"(?i)forbidden",
                r"(?i)api.?key",
                r"(?i)credential",
                r"(?i)\bauth(entication|orization)?\b",
            ])
            .expect("auth rules"),
        ),
        (
            ErrorCategory::RateLimit,
            RegexSet::new([
                r"(?i)rate.?limit",
                r"(?i)too many requests",
                r"\b429\b",
                r"(?i)quota",
                r"(?i)throttl",
            ])
            .expect("rate limit rules"),
        ),
        (
            ErrorCategory::Input,
            RegexSet::new([
                r"(?i)invalid (input|request|text)",
                r"(?i)empty text",
                r"(?i)too (long|large)",
                r"(?i)batch size",
                r"(?i)malformed",
            ])
            .expect("input rules"),
        ),
    ];
}

impl TranslateError {
    /// Build an error with the category's default retryability and suggestion.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            retryable: category.retryable(),
            message: message.into(),
            suggestion: category.suggestion().to_string(),
        }
    }

    /// Build a non-retryable error regardless of category default.
    ///
    /// Used for gate rejections: an open circuit or exhausted budget turns
    /// a would-be retryable condition into an immediate failure.
    pub fn blocked(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(category, message)
        }
    }

    /// Classify a raw error message against the category rule sets.
    ///
    /// Rules run in taxonomy order and the first match wins; anything
    /// unmatched lands in `internal`.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let category = CATEGORY_RULES
            .iter()
            .find(|(_, rules)| rules.is_match(&message))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Internal);
        Self::new(category, message)
    }

    /// Classify from an HTTP status code, falling back to the message rules.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let category = match status {
            429 => Some(ErrorCategory::RateLimit),
            401 | 403 => Some(ErrorCategory::Auth),
            408 | 504 => Some(ErrorCategory::Timeout),
            500..=599 => Some(ErrorCategory::Model),
            400..=499 => Some(ErrorCategory::Input),
            _ => None,
        };
        match category {
            Some(category) => Self::new(category, message),
            None => Self::classify(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network() {
        let err = TranslateError::classify("fetch failed: connection refused");
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.retryable);
    }

    #[test]
    fn test_classify_auth_not_retryable() {
        let err = TranslateError::classify("invalid API key provided");
        assert_eq!(err.category, ErrorCategory::Auth);
        assert!(!err.retryable);
        assert!(!err.suggestion.is_empty());
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = TranslateError::classify("429 Too Many Requests");
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.retryable);
    }

    #[test]
    fn test_first_match_wins_in_taxonomy_order() {
        // "network timeout" matches the network rules before the timeout rules.
        let err = TranslateError::classify("network timeout while connecting");
        assert_eq!(err.category, ErrorCategory::Network);
    }

    #[test]
    fn test_unmatched_falls_back_to_internal() {
        let err = TranslateError::classify("something inexplicable happened");
        assert_eq!(err.category, ErrorCategory::Internal);
        assert!(!err.retryable);
    }

    #[test]
    fn test_from_status() {
        assert_eq!(
            TranslateError::from_status(429, "slow down").category,
            ErrorCategory::RateLimit
        );
        assert_eq!(
            TranslateError::from_status(401, "nope").category,
            ErrorCategory::Auth
        );
        assert_eq!(
            TranslateError::from_status(503, "unavailable").category,
            ErrorCategory::Model
        );
        assert_eq!(
            TranslateError::from_status(400, "bad body").category,
            ErrorCategory::Input
        );
    }

    #[test]
    fn test_blocked_overrides_retryability() {
        let err = TranslateError::blocked(ErrorCategory::RateLimit, "circuit open");
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(!err.retryable);
    }
}
