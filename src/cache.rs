//! C5 (cache layer) — deterministic cache-key fingerprinting and the
//! pluggable [`CacheProvider`] seam, with TTL and stale-while-revalidate
//! support per spec.md §4.5.
//!
//! Grounded directly on the teacher's `cache.rs`: `compute_cache_key`'s
//! SHA-256-over-sorted-JSON fingerprint and its internal-field filtering
//! are kept verbatim in spirit, generalized from `__`-prefixed descriptor
//! fields to this spec's cache-key inputs (task name + resolved input).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cache error: {message}"))]
    Cache { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub output: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
    pub stale_ttl: Option<Duration>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.cached_at < chrono::Duration::from_std(self.ttl).unwrap_or_default()
    }

    /// Stale but still usable as a stand-in while the task is re-executed
    /// in the background (spec.md §4.5's stale-while-revalidate window).
    #[must_use]
    pub fn is_stale_but_servable(&self, now: DateTime<Utc>) -> bool {
        if self.is_fresh(now) {
            return false;
        }
        let Some(stale_ttl) = self.stale_ttl else {
            return false;
        };
        now - self.cached_at < chrono::Duration::from_std(self.ttl + stale_ttl).unwrap_or_default()
    }
}

/// Pluggable cache provider for idempotent task execution.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn set(&self, entry: CacheEntry) -> Result<()>;
    async fn invalidate(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCache {
    store: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheProvider for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let store = self.store.lock().map_err(|_| Error::Cache {
            message: "cache lock poisoned".to_string(),
        })?;
        Ok(store.get(key).cloned())
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        let mut store = self.store.lock().map_err(|_| Error::Cache {
            message: "cache lock poisoned".to_string(),
        })?;
        store.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut store = self.store.lock().map_err(|_| Error::Cache {
            message: "cache lock poisoned".to_string(),
        })?;
        store.remove(key);
        Ok(())
    }
}

fn filter_internal_fields(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(obj) => {
            let filtered: serde_json::Map<String, serde_json::Value> = obj
                .iter()
                .filter(|(key, _)| !key.starts_with("__"))
                .map(|(k, v)| (k.clone(), filter_internal_fields(v)))
                .collect();
            serde_json::Value::Object(filtered)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(filter_internal_fields).collect()),
        _ => value.clone(),
    }
}

fn normalize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| *k);
            let normalized: serde_json::Map<String, serde_json::Value> =
                sorted.into_iter().map(|(k, v)| (k.clone(), normalize_json(v))).collect();
            serde_json::Value::Object(normalized)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(normalize_json).collect()),
        _ => value.clone(),
    }
}

/// Deterministic cache-key fingerprint: SHA-256 over `task_name` plus a
/// key-sorted, internal-field-filtered JSON serialization of `inputs`.
#[must_use]
pub fn compute_cache_key(task_name: &str, inputs: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};

    let filtered = filter_internal_fields(inputs);
    let normalized = normalize_json(&filtered);
    let inputs_json = serde_json::to_string(&normalized).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(format!("{task_name}:{inputs_json}"));
    let digest = hasher.finalize();

    format!("{task_name}:{digest:x}")
}
