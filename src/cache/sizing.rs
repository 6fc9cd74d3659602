//! Cache key fingerprinting and approximate entry sizing.

use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Fixed bookkeeping cost charged per entry (node links, timestamps,
/// counters).
pub const ENTRY_OVERHEAD: usize = 80;

/// Per-object-key overhead inside a value.
const KEY_OVERHEAD: usize = 16;

/// Fingerprint of (text, source, target, provider) used as the cache key.
///
/// Non-cryptographic by design: the hash bounds key length and avoids
/// holding raw text as a key; collisions are an accepted tradeoff.
pub fn fingerprint(text: &str, source: &str, target: &str, provider: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    source.hash(&mut hasher);
    target.hash(&mut hasher);
    provider.hash(&mut hasher);
    hasher.finish()
}

/// Approximate resident size of a JSON value in bytes.
///
/// Strings count as UTF-16 (two bytes per char), numbers and booleans as
/// 8 bytes, object keys carry a fixed overhead. `serde_json::Value` is
/// acyclic, so plain recursion needs no visited-set.
pub fn approximate_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 8,
        Value::Number(_) => 8,
        Value::String(s) => s.chars().count() * 2,
        Value::Array(items) => items.iter().map(approximate_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| KEY_OVERHEAD + key.chars().count() * 2 + approximate_size(item))
            .sum(),
    }
}
