//! Registration-ordered provider registry.
//!
//! Providers register once and are immutable afterwards except for the
//! enabled flag and the usage counter the router feeds back into scoring.
//! Registration order is preserved because router ties break by it.

use parking_lot::RwLock;
use std::sync::Arc;

use super::{ProviderInfo, TranslationProvider};

struct ProviderEntry {
    provider: Arc<dyn TranslationProvider>,
    info: ProviderInfo,
    enabled: bool,
    usage: u64,
}

/// Owned snapshot of one registered provider, handed to the router.
#[derive(Clone)]
pub struct ProviderSnapshot {
    /// The adapter itself.
    pub provider: Arc<dyn TranslationProvider>,

    /// Static description captured at registration.
    pub info: ProviderInfo,

    /// Preference toggle.
    pub enabled: bool,

    /// Successful selections so far.
    pub usage: u64,

    /// Position in registration order.
    pub index: usize,
}

/// Registry of translation providers.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<Vec<ProviderEntry>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, enabled by default.
    ///
    /// Re-registering an id replaces the adapter but keeps the original
    /// position and usage counter.
    pub fn register(&self, provider: Arc<dyn TranslationProvider>) {
        let info = provider.info();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.info.id == info.id) {
            existing.provider = provider;
            existing.info = info;
            return;
        }
        entries.push(ProviderEntry {
            provider,
            info,
            enabled: true,
            usage: 0,
        });
    }

    /// Toggle the preference flag for a provider.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.info.id == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Look up a provider by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn TranslationProvider>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.info.id == id)
            .map(|e| Arc::clone(&e.provider))
    }

    /// Increment a provider's usage counter and return the new value.
    pub fn record_usage(&self, id: &str) -> u64 {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.info.id == id) {
            Some(entry) => {
                entry.usage += 1;
                entry.usage
            }
            None => 0,
        }
    }

    /// Current usage counter for a provider.
    pub fn usage(&self, id: &str) -> u64 {
        self.entries
            .read()
            .iter()
            .find(|e| e.info.id == id)
            .map(|e| e.usage)
            .unwrap_or(0)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.info.id.clone())
            .collect()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Owned snapshots of every entry, in registration order.
    pub fn snapshots(&self) -> Vec<ProviderSnapshot> {
        self.entries
            .read()
            .iter()
            .enumerate()
            .map(|(index, e)| ProviderSnapshot {
                provider: Arc::clone(&e.provider),
                info: e.info.clone(),
                enabled: e.enabled,
                usage: e.usage,
                index,
            })
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}
