//! Prefix state store
//!
//! A process-local cache (DashMap) in front of a shared durable store:
//! - Reads check the cache, then the shared store, populating the cache on a hit
//! - Writes go to the shared store first, then the cache (write-through)
//! - The shared store owns the TTL; cached entries never outlive what it reported
//!
//! There is no invalidation across processes. Two instances tracking the same
//! prefix can read stale state from their own caches until the entries
//! expire, so prefixes must be partitioned between instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::models::PrefixState;

pub const PREFIX_KEY_PREFIX: &str = "prefix:";

pub fn prefix_key(prefix: &str) -> String {
    format!("{}{}", PREFIX_KEY_PREFIX, prefix)
}

/// Value held by the shared store with its expiry
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Shared key-value store with per-entry TTL
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Live (unexpired) entry for `key`
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Live entries whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>>;
    /// Drop expired entries; returns how many were removed
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// In-process shared store, for single-node runs and tests
#[derive(Default)]
pub struct MemoryKvBackend {
    store: DashMap<String, KvEntry>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        if let Some(entry) = self.store.get(key) {
            if entry.expires_at <= Utc::now() {
                drop(entry);
                self.store.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value().clone()));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).context("TTL out of range")?;
        self.store.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>> {
        let now = Utc::now();
        self.store.retain(|_, entry| entry.expires_at > now);
        Ok(self
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.store.len();
        self.store.retain(|_, entry| entry.expires_at > now);
        Ok(before.saturating_sub(self.store.len()))
    }
}

struct CachedState {
    state: PrefixState,
    expires_at: Instant,
}

pub struct StateStore {
    cache: DashMap<String, CachedState>,
    shared: Arc<dyn KvBackend>,
    max_entries: usize,
}

impl StateStore {
    pub fn new(shared: Arc<dyn KvBackend>, max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            shared,
            max_entries: max_entries.max(1),
        }
    }

    pub async fn get(&self, prefix: &str) -> Result<Option<PrefixState>> {
        if let Some(entry) = self.cache.get(prefix) {
            if Instant::now() < entry.expires_at {
                return Ok(Some(entry.state.clone()));
            }
            drop(entry);
            self.cache.remove(prefix);
        }

        let Some(entry) = self.shared.get(&prefix_key(prefix)).await? else {
            return Ok(None);
        };
        let state: PrefixState = serde_json::from_str(&entry.value)
            .with_context(|| format!("Corrupt prefix state for {}", prefix))?;

        let remaining = (entry.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.cache_insert(prefix, state.clone(), remaining);
        debug!(prefix, "state_cache_fill");
        Ok(Some(state))
    }

    pub async fn put(&self, prefix: &str, state: &PrefixState, ttl: Duration) -> Result<()> {
        let value = serde_json::to_string(state)?;
        self.shared.put(&prefix_key(prefix), &value, ttl).await?;
        self.cache_insert(prefix, state.clone(), ttl);
        Ok(())
    }

    pub async fn delete(&self, prefix: &str) -> Result<()> {
        self.cache.remove(prefix);
        self.shared.delete(&prefix_key(prefix)).await
    }

    /// Every live state in the shared store (bypasses the cache)
    pub async fn scan(&self) -> Result<Vec<PrefixState>> {
        let entries = self.shared.scan_prefix(PREFIX_KEY_PREFIX).await?;
        let mut states = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            match serde_json::from_str::<PrefixState>(&entry.value) {
                Ok(state) => states.push(state),
                Err(e) => debug!(key = %key, error = %e, "state_scan_skip_corrupt"),
            }
        }
        Ok(states)
    }

    /// Purge expired entries from the shared store and the local cache.
    /// Returns the number removed from the shared store.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        self.cache.retain(|_, entry| entry.expires_at > now);
        let purged = self.shared.purge_expired().await?;
        if purged > 0 {
            debug!(purged, cached = self.cache.len(), "state_store_purged");
        }
        Ok(purged)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn cache_insert(&self, prefix: &str, state: PrefixState, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.cache.insert(
            prefix.to_string(),
            CachedState {
                state,
                expires_at: Instant::now() + ttl,
            },
        );
        self.maybe_evict();
    }

    fn maybe_evict(&self) {
        let current_size = self.cache.len();
        if current_size <= self.max_entries {
            return;
        }

        let now = Instant::now();
        self.cache.retain(|_, entry| entry.expires_at > now);

        let current_size = self.cache.len();
        if current_size > self.max_entries {
            let to_evict = (current_size / 10).max(current_size - self.max_entries);
            let keys_to_remove: Vec<String> = self
                .cache
                .iter()
                .take(to_evict)
                .map(|entry| entry.key().clone())
                .collect();
            for key in keys_to_remove {
                self.cache.remove(&key);
            }
            debug!(
                evicted = to_evict,
                size = self.cache.len(),
                "state_cache_evicted"
            );
        }
    }
}
