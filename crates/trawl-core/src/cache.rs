//! Bounded, TTL-and-recency response cache.
//!
//! Entries are kept in least-recently-used order. Every insert enforces two
//! bounds, in this order:
//!
//! 1. entry count `<= max_size`
//! 2. total estimated memory `<= memory_threshold_bytes`
//!
//! Both are enforced by evicting the least-recently-used entry, whatever its
//! remaining TTL. Expiry itself is lazy: an expired entry is only dropped
//! when a `get` touches it (or on an explicit [`ResponseCache::purge_expired`]).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::models::compute_hash;

/// Fixed per-entry bookkeeping cost added to every size estimate.
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Configuration for the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_size: usize,
    /// Maximum sum of entry size estimates.
    pub memory_threshold_bytes: usize,
    /// TTL used when callers don't supply one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            memory_threshold_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn new(max_size: usize, memory_threshold_bytes: usize) -> Self {
        Self {
            max_size,
            memory_threshold_bytes,
            ..Default::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Cache key derived from an endpoint and its parameters.
///
/// Parameters are canonicalised by key order, so two requests differing
/// only in parameter order map to the same key. Keys and values are
/// form-encoded and the endpoint is length-prefixed, so distinct requests
/// never share a canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(endpoint: &str, params: &BTreeMap<String, String>) -> Self {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        let canonical = format!("{}:{endpoint}?{query}", endpoint.len());
        Self(compute_hash(&canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Arc<str>,
    inserted_at: Instant,
    ttl: Duration,
    last_accessed_at: DateTime<Utc>,
    size_estimate: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }

    fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.duration_since(self.inserted_at))
    }
}

/// One entry of a [`CacheSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshotEntry {
    pub key: String,
    pub payload: String,
    /// Remaining time-to-live at the moment the snapshot was taken.
    pub ttl_ms: u64,
    pub last_accessed_at: DateTime<Utc>,
}

/// Serializable image of every live cache entry, least recently used first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub entries: Vec<CacheSnapshotEntry>,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct CacheInner {
    entries: LruCache<CacheKey, CacheEntry>,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.memory_bytes -= entry.size_estimate;
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, entry)) => {
                self.memory_bytes -= entry.size_estimate;
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

/// Thread-safe response cache. All mutations run under a single lock so the
/// recency order and the size/memory accounting change atomically.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                memory_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock_inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cache mutex");
            poisoned.into_inner()
        })
    }

    fn size_estimate(key: &CacheKey, payload: &str) -> usize {
        key.0.len() + payload.len() + ENTRY_OVERHEAD_BYTES
    }

    /// Return the payload for `key` if present and unexpired, marking the
    /// entry most recently used. Expired entries are dropped here.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<str>> {
        let mut inner = self.lock_inner();
        let now = Instant::now();

        let expired = match inner.entries.peek(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_accessed_at = Utc::now();
        Some(entry.payload.clone())
    }

    /// Insert with the configured default TTL.
    pub fn insert(&self, key: CacheKey, payload: impl Into<Arc<str>>) -> bool {
        self.set(key, payload, self.config.default_ttl)
    }

    /// Insert or overwrite `key`, making it the most recently used entry,
    /// then evict least-recently-used entries until both bounds hold.
    ///
    /// Returns `false` when the payload alone exceeds the memory threshold
    /// (or the cache has no capacity) and was therefore not stored.
    pub fn set(&self, key: CacheKey, payload: impl Into<Arc<str>>, ttl: Duration) -> bool {
        let payload = payload.into();
        let size_estimate = Self::size_estimate(&key, &payload);
        let mut inner = self.lock_inner();

        // A stale value must not survive a rejected overwrite.
        inner.remove(&key);

        if self.config.max_size == 0 || size_estimate > self.config.memory_threshold_bytes {
            tracing::debug!(
                size = size_estimate,
                threshold = self.config.memory_threshold_bytes,
                "Payload too large to cache"
            );
            return false;
        }

        inner.entries.push(
            key,
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
                ttl,
                last_accessed_at: Utc::now(),
                size_estimate,
            },
        );
        inner.memory_bytes += size_estimate;

        while inner.entries.len() > self.config.max_size {
            inner.evict_lru();
        }
        while inner.memory_bytes > self.config.memory_threshold_bytes {
            if !inner.evict_lru() {
                break;
            }
            tracing::trace!(
                memory_bytes = inner.memory_bytes,
                "Evicted entry under memory pressure"
            );
        }
        true
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock_inner().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.entries.clear();
        inner.memory_bytes = 0;
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_bytes(&self) -> usize {
        self.lock_inner().memory_bytes
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock_inner().entries.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock_inner();
        CacheStats {
            entries: inner.entries.len(),
            memory_bytes: inner.memory_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        self.lock_inner()
            .entries
            .iter()
            .rev()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Capture every unexpired entry, least recently used first.
    pub fn backup(&self) -> CacheSnapshot {
        let inner = self.lock_inner();
        let now = Instant::now();
        let entries = inner
            .entries
            .iter()
            .rev()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| CacheSnapshotEntry {
                key: k.0.clone(),
                payload: e.payload.to_string(),
                ttl_ms: e.remaining_ttl(now).as_millis() as u64,
                last_accessed_at: e.last_accessed_at,
            })
            .collect();
        CacheSnapshot {
            taken_at: Some(Utc::now()),
            entries,
        }
    }

    /// Load entries from a snapshot, oldest access first so that recency
    /// order is reproduced. Bounds are enforced as for any insert.
    /// Returns the number of entries restored.
    pub fn restore(&self, snapshot: &CacheSnapshot) -> usize {
        let mut ordered: Vec<&CacheSnapshotEntry> = snapshot.entries.iter().collect();
        ordered.sort_by_key(|e| e.last_accessed_at);

        let mut restored = 0;
        for entry in ordered {
            if entry.ttl_ms == 0 {
                continue;
            }
            let key = CacheKey(entry.key.clone());
            if self.set(
                key.clone(),
                entry.payload.as_str(),
                Duration::from_millis(entry.ttl_ms),
            ) {
                if let Some(live) = self.lock_inner().entries.peek_mut(&key) {
                    live.last_accessed_at = entry.last_accessed_at;
                }
                restored += 1;
            }
        }
        tracing::info!(restored, "Restored response cache from snapshot");
        restored
    }
}
