//! Dispatch orchestrator.
//!
//! Composes the core per request: validate input, consult the result
//! cache, enforce the sliding-window budget, route to a provider gated by
//! the circuit breaker and rate-limit detector, and run the provider call
//! under the retry executor. All component instances are explicitly
//! constructed and owned here; tests build fresh orchestrators instead of
//! resetting globals.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

use crate::cache::{CacheKey, KeyValueStore, TranslationCache};
use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::error::{ErrorCategory, TranslateError};
use crate::providers::{
    ProviderError, ProviderRegistry, TranslateOptions, Translation, TranslationProvider,
};
use crate::resilience::{
    estimate_tokens, with_retry, CircuitBreaker, RateLimitDetector, RequestRef, ResponseSignal,
    SlidingWindowBudget,
};
use crate::router::{ProviderRouter, RouterError};

/// One text or a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextPayload {
    Single(String),
    Batch(Vec<String>),
}

/// Request accepted at the orchestrator boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub text: TextPayload,
    pub source_lang: String,
    pub target_lang: String,

    /// Pin the request to a specific provider, bypassing routing.
    #[serde(default)]
    pub provider: Option<String>,

    /// Adapter pass-through options (timeout override, abort signal).
    #[serde(skip)]
    pub options: Option<TranslateOptions>,
}

impl TranslateRequest {
    /// Single-text request with routed provider selection.
    pub fn single(
        text: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            text: TextPayload::Single(text.into()),
            source_lang: source.into(),
            target_lang: target.into(),
            provider: None,
            options: None,
        }
    }
}

/// Response shape at the orchestrator boundary.
#[derive(Debug, Clone, Serialize)]
pub struct TranslateOutcome {
    pub success: bool,

    /// Translated text (string) or batch (array of strings).
    pub result: Option<Value>,

    pub error: Option<String>,

    pub duration_ms: u64,

    pub cached: bool,
}

/// The dispatch orchestrator.
pub struct DispatchOrchestrator {
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<ProviderRegistry>,
    router: ProviderRouter,
    cache: TranslationCache,
    breaker: Arc<CircuitBreaker>,
    detector: RateLimitDetector,
    budget: SlidingWindowBudget,
}

impl DispatchOrchestrator {
    /// Orchestrator on the system clock, memory-only cache.
    pub fn new(config: DispatchConfig) -> Self {
        DispatchOrchestratorBuilder::new().config(config).build()
    }

    /// Register a provider.
    pub fn register_provider(&self, provider: Arc<dyn TranslationProvider>) {
        self.registry.register(Arc::clone(&provider));
    }

    /// Provider registry, for preference toggles and introspection.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Result cache, for warm-up ([`TranslationCache::load`]) and stats.
    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    /// Per-provider circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Adaptive rate-limit detector.
    pub fn detector(&self) -> &RateLimitDetector {
        &self.detector
    }

    /// Handle one request end to end. Failures are embedded in the
    /// outcome; this never panics or returns a bare error.
    pub async fn translate(&self, request: TranslateRequest) -> TranslateOutcome {
        let started = self.clock.now_ms();
        match self.dispatch(&request).await {
            Ok((result, cached)) => TranslateOutcome {
                success: true,
                result: Some(result),
                error: None,
                duration_ms: self.clock.now_ms().saturating_sub(started),
                cached,
            },
            Err(err) => {
                tracing::debug!(
                    category = %err.category,
                    retryable = err.retryable,
                    "dispatch failed: {}",
                    err.message
                );
                TranslateOutcome {
                    success: false,
                    result: None,
                    error: Some(format!("{} ({})", err.message, err.suggestion)),
                    duration_ms: self.clock.now_ms().saturating_sub(started),
                    cached: false,
                }
            }
        }
    }

    async fn dispatch(&self, request: &TranslateRequest) -> Result<(Value, bool), TranslateError> {
        // (a) Validate and sanitize.
        let texts = self.validate(request)?;
        let source = request.source_lang.as_str();
        let target = request.target_lang.as_str();

        // (b) Cache check. "auto" sources are unknown to the cache key.
        let cacheable = source != "auto";
        let joined = texts.join("\u{1f}");
        let key_provider = request.provider.as_deref().unwrap_or("auto");
        let cache_key = CacheKey::for_request(&joined, source, target, key_provider);
        if cacheable {
            if let Some(hit) = self.cache.get(cache_key) {
                return Ok((hit, true));
            }
        }

        // (c) Budget, independent of the breakers.
        let tokens: u32 = texts.iter().map(|t| estimate_tokens(t)).sum();
        if !self.budget.try_acquire(tokens) {
            return Err(TranslateError::blocked(
                ErrorCategory::RateLimit,
                "request budget exhausted for the current window",
            ));
        }

        // (d) Provider selection, gated by breaker and detector.
        let (provider, provider_id) = self.pick_provider(request, source, target)?;

        // (e) Provider call under the retry executor. The predicate
        // rechecks both gates so an opened circuit stops further attempts
        // instead of hammering a failing backend.
        let options = request.options.clone().unwrap_or_default();
        let pid: &str = &provider_id;
        let provider_ref = &provider;
        let texts_ref = &texts;
        let options_ref = &options;

        let translations = with_retry(
            &self.config.retry,
            |err: &TranslateError| {
                err.retryable
                    && self.breaker.is_available(pid)
                    && self.detector.check_request_allowed(pid)
            },
            move || async move {
                self.attempt(provider_ref, pid, texts_ref, source, target, options_ref)
                    .await
            },
        )
        .await?;

        // (f) Record and cache the success.
        let result = match &request.text {
            TextPayload::Single(_) => Value::String(
                translations
                    .first()
                    .map(|t| t.text.clone())
                    .unwrap_or_default(),
            ),
            TextPayload::Batch(_) => Value::Array(
                translations
                    .iter()
                    .map(|t| Value::String(t.text.clone()))
                    .collect(),
            ),
        };
        if cacheable {
            self.cache.set(cache_key, result.clone(), None);
        }

        Ok((result, false))
    }

    /// One full attempt: register with the detector, call the provider
    /// under the configured timeout, and report the outcome to both
    /// resilience layers.
    async fn attempt(
        &self,
        provider: &Arc<dyn TranslationProvider>,
        provider_id: &str,
        texts: &[String],
        source: &str,
        target: &str,
        options: &TranslateOptions,
    ) -> Result<Vec<Translation>, TranslateError> {
        let request_id = self.detector.start_request(provider_id);

        let call = async {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                out.push(provider.translate(text, source, target, options).await?);
            }
            Ok::<_, ProviderError>(out)
        };

        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(Ok(translations)) => {
                self.breaker.record_success(provider_id);
                self.detector
                    .record_response(RequestRef::Id(request_id), &ResponseSignal::ok());
                Ok(translations)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure(provider_id);
                self.detector
                    .record_error(RequestRef::Id(request_id), &signal_for(&err));
                Err(err.into())
            }
            Err(_) => {
                // Deadline-based abandonment counts as a failure for both
                // breaker and backoff accounting.
                self.breaker.record_failure(provider_id);
                self.detector
                    .record_error(RequestRef::Id(request_id), &ResponseSignal::default());
                Err(TranslateError::new(
                    ErrorCategory::Timeout,
                    format!(
                        "provider call timed out after {}ms",
                        self.config.provider_timeout.as_millis()
                    ),
                ))
            }
        }
    }

    fn pick_provider(
        &self,
        request: &TranslateRequest,
        source: &str,
        target: &str,
    ) -> Result<(Arc<dyn TranslationProvider>, String), TranslateError> {
        match request.provider.as_deref() {
            Some(id) => {
                let provider = self.registry.get(id).ok_or_else(|| {
                    TranslateError::new(
                        ErrorCategory::Input,
                        format!("unknown provider '{id}'"),
                    )
                })?;
                if !self.breaker.is_available(id) {
                    return Err(TranslateError::blocked(
                        ErrorCategory::Model,
                        format!("circuit open for provider '{id}'"),
                    ));
                }
                if !self.detector.check_request_allowed(id) {
                    return Err(TranslateError::blocked(
                        ErrorCategory::RateLimit,
                        format!("provider '{id}' is rate limited"),
                    ));
                }
                Ok((provider, id.to_string()))
            }
            None => {
                let selection = self.router.select(source, target).map_err(|err| match err {
                    RouterError::NoProviderAvailable { .. } => {
                        TranslateError::new(ErrorCategory::Language, err.to_string())
                    }
                    // Breaker exclusion is transient backend trouble, not a
                    // language problem.
                    RouterError::CircuitsOpen { .. } => {
                        TranslateError::blocked(ErrorCategory::Model, err.to_string())
                    }
                })?;
                if !self.detector.check_request_allowed(&selection.id) {
                    return Err(TranslateError::blocked(
                        ErrorCategory::RateLimit,
                        format!("provider '{}' is rate limited", selection.id),
                    ));
                }
                // Usage feeds the router's load penalty, so it is recorded
                // only when the selection actually dispatches.
                self.registry.record_usage(&selection.id);
                Ok((selection.provider, selection.id))
            }
        }
    }

    fn validate(&self, request: &TranslateRequest) -> Result<Vec<String>, TranslateError> {
        let raw: Vec<&str> = match &request.text {
            TextPayload::Single(s) => vec![s.as_str()],
            TextPayload::Batch(batch) => batch.iter().map(String::as_str).collect(),
        };

        if raw.is_empty() {
            return Err(TranslateError::new(
                ErrorCategory::Input,
                "empty text batch",
            ));
        }
        if raw.len() > self.config.max_batch {
            return Err(TranslateError::new(
                ErrorCategory::Input,
                format!(
                    "batch size {} exceeds the maximum of {}",
                    raw.len(),
                    self.config.max_batch
                ),
            ));
        }

        let mut texts = Vec::with_capacity(raw.len());
        for item in raw {
            let clean = sanitize(item);
            if clean.is_empty() {
                return Err(TranslateError::new(ErrorCategory::Input, "empty text"));
            }
            let chars = clean.chars().count();
            if chars > self.config.max_text_len {
                return Err(TranslateError::new(
                    ErrorCategory::Input,
                    format!(
                        "text of {chars} characters exceeds the maximum of {}",
                        self.config.max_text_len
                    ),
                ));
            }
            texts.push(clean);
        }

        if request.source_lang != "auto" && !valid_lang_code(&request.source_lang) {
            return Err(TranslateError::new(
                ErrorCategory::Input,
                format!("invalid source language code '{}'", request.source_lang),
            ));
        }
        if !valid_lang_code(&request.target_lang) {
            return Err(TranslateError::new(
                ErrorCategory::Input,
                format!("invalid target language code '{}'", request.target_lang),
            ));
        }

        Ok(texts)
    }
}

/// Trim, NFC-normalize, and strip control characters, keeping newlines
/// and tabs. Normalization keeps composed and decomposed forms of the
/// same text on one cache key.
fn sanitize(text: &str) -> String {
    text.trim()
        .nfc()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

lazy_static! {
    static ref LANG_CODE: Regex =
        Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z0-9]{2,8})?$").expect("lang code pattern");
}

fn valid_lang_code(code: &str) -> bool {
    LANG_CODE.is_match(code)
}

fn signal_for(err: &ProviderError) -> ResponseSignal {
    match err {
        ProviderError::RateLimited { retry_after } => ResponseSignal {
            is_rate_limit: true,
            retry_after: retry_after.map(|d| d.as_secs().to_string()),
            ..ResponseSignal::default()
        },
        ProviderError::ApiError { status, .. } => ResponseSignal::status(*status),
        _ => ResponseSignal::default(),
    }
}

/// Builder for [`DispatchOrchestrator`].
pub struct DispatchOrchestratorBuilder {
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl DispatchOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
            clock: Arc::new(SystemClock),
            store: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject a clock (tests use [`crate::clock::ManualClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Back the cache with a persistent store.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the orchestrator with fresh component instances.
    pub fn build(self) -> DispatchOrchestrator {
        let registry = Arc::new(ProviderRegistry::new());
        let breaker = Arc::new(CircuitBreaker::new(
            self.config.breaker.clone(),
            Arc::clone(&self.clock),
        ));
        let router = ProviderRouter::with_breaker(
            Arc::clone(&registry),
            self.config.router.clone(),
            Arc::clone(&breaker),
        );
        let cache = match self.store {
            Some(store) => TranslationCache::with_store(
                self.config.cache.clone(),
                Arc::clone(&self.clock),
                store,
            ),
            None => TranslationCache::new(self.config.cache.clone(), Arc::clone(&self.clock)),
        };
        let detector =
            RateLimitDetector::new(self.config.rate_limit.clone(), Arc::clone(&self.clock));
        let budget =
            SlidingWindowBudget::new(self.config.budget.clone(), Arc::clone(&self.clock));

        DispatchOrchestrator {
            config: self.config,
            clock: self.clock,
            registry,
            router,
            cache,
            breaker,
            detector,
            budget,
        }
    }
}

impl Default for DispatchOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
