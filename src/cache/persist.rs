//! Cache persistence through a pluggable key-value store.
//!
//! The store is a narrow seam over whatever durable storage the host
//! offers. Absence of a store degrades the cache to memory-only; store
//! failures are counted and logged, never propagated — the in-memory path
//! must never depend on durability.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

/// Storage key holding the serialized entry set.
pub const CACHE_STORE_KEY: &str = "lingoflow/cache/v1";

/// Errors from a key-value store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(String),

    #[error("store unavailable")]
    Unavailable,
}

/// Minimal persistent key-value store contract.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the requested keys; missing keys are simply absent from the map.
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    /// Write all entries.
    async fn set(&self, entries: HashMap<String, Vec<u8>>) -> Result<(), StoreError>;

    /// Delete the given keys.
    async fn remove(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// In-process store used in tests and as the memory-only fallback.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let data = self.data.lock();
        Ok(keys
            .iter()
            .filter_map(|k| data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, entries: HashMap<String, Vec<u8>>) -> Result<(), StoreError> {
        self.data.lock().extend(entries);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}

/// One entry in the persisted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: u64,
    pub value: Value,
    pub stored_at_ms: u64,
    pub ttl_ms: u64,
    pub access_count: u64,
}

/// Serialize entries, gzip-compressing when asked.
///
/// Compression failure degrades to the raw JSON payload; the caller
/// counts the degradation. Serialization itself failing yields `None`.
pub fn encode_entries(entries: &[PersistedEntry], compress: bool) -> Option<(Vec<u8>, bool)> {
    let raw = match serde_json::to_vec(entries) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "cache payload serialization failed");
            return None;
        }
    };

    if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let compressed = encoder
            .write_all(&raw)
            .and_then(|_| encoder.finish());
        match compressed {
            Ok(bytes) => return Some((bytes, true)),
            Err(e) => {
                tracing::warn!(error = %e, "cache payload compression failed, storing raw");
            }
        }
    }

    Some((raw, false))
}

/// Decode a persisted payload, trying gzip first, then raw JSON.
pub fn decode_entries(bytes: &[u8]) -> Option<Vec<PersistedEntry>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut inflated = Vec::new();
    if decoder.read_to_end(&mut inflated).is_ok() {
        if let Ok(entries) = serde_json::from_slice(&inflated) {
            return Some(entries);
        }
    }

    match serde_json::from_slice(bytes) {
        Ok(entries) => Some(entries),
        Err(e) => {
            tracing::warn!(error = %e, "persisted cache payload unreadable, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_entries() -> Vec<PersistedEntry> {
        vec![
            PersistedEntry {
                key: 1,
                value: json!("Hei"),
                stored_at_ms: 0,
                ttl_ms: 60_000,
                access_count: 2,
            },
            PersistedEntry {
                key: 2,
                value: json!(["a", "b"]),
                stored_at_ms: 10,
                ttl_ms: 60_000,
                access_count: 0,
            },
        ]
    }

    #[test]
    fn test_compressed_round_trip() {
        let entries = sample_entries();
        let (bytes, compressed) = encode_entries(&entries, true).unwrap();
        assert!(compressed);

        let decoded = decode_entries(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].value, json!("Hei"));
    }

    #[test]
    fn test_raw_round_trip() {
        let entries = sample_entries();
        let (bytes, compressed) = encode_entries(&entries, false).unwrap();
        assert!(!compressed);
        assert_eq!(decode_entries(&bytes).unwrap().len(), 2);
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(decode_entries(b"definitely not json").is_none());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        let mut entries = HashMap::new();
        entries.insert("k".to_string(), vec![1, 2, 3]);
        store.set(entries).await.unwrap();

        let got = store.get(&["k".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["k"], vec![1, 2, 3]);

        store.remove(&["k".to_string()]).await.unwrap();
        assert!(store.get(&["k".to_string()]).await.unwrap().is_empty());
    }
}
