//! Two-tier response cache.
//!
//! Lookups try the in-process fast tier first, then the durable tier backed
//! by the ledger database. A durable hit is copied into the fast tier. Keys
//! are SHA-256 digests of `(prompt, model_key)`, so the same prompt sent to
//! two models never shares an entry.
//!
//! Cache failures are never fatal: an unreadable tier reads as a miss and a
//! failed write is logged by whoever performed it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ring::digest::{digest, SHA256};
use sb_core::clock::SharedClock;
use sb_core::config::CacheConfig;
use sb_core::store::{ResponseStore, StoreError};
use sb_core::types::CacheEntry;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Longer TTLs are clamped to ten years.
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum CacheTierError {
    #[error("durable tier: {0}")]
    Store(#[from] StoreError),
}

/// One storage layer of the cache.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;
    /// A live entry for `key`, with its hit count already bumped.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheTierError>;
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheTierError>;
    /// Drop expired entries, returning how many went.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheTierError>;
}

// ---------------------------------------------------------------------------
// Fast tier
// ---------------------------------------------------------------------------

/// Bounded in-memory map. When full, expired entries go first, then the
/// least-hit entry (oldest access breaks ties).
pub struct MemoryTier {
    entries: RwLock<AHashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    fn evict(entries: &mut AHashMap<String, CacheEntry>, now: DateTime<Utc>) {
        entries.retain(|_, e| !e.is_expired(now));
        let victim = entries
            .values()
            .min_by(|a, b| {
                a.hit_count
                    .cmp(&b.hit_count)
                    .then(a.last_accessed.cmp(&b.last_accessed))
            })
            .map(|e| e.key.clone());
        if let Some(key) = victim {
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheTierError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            entries.remove(key);
            return Ok(None);
        }
        entry.hit_count += 1;
        entry.last_accessed = now;
        Ok(Some(entry.clone()))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheTierError> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&entry.key) && entries.len() >= self.max_entries {
            Self::evict(&mut entries, entry.last_accessed);
        }
        entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheTierError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}

// ---------------------------------------------------------------------------
// Durable tier
// ---------------------------------------------------------------------------

pub struct DurableTier {
    store: Arc<dyn ResponseStore>,
}

impl DurableTier {
    pub fn new(store: Arc<dyn ResponseStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CacheTier for DurableTier {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheTierError> {
        Ok(self.store.get_response(key, now).await?)
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheTierError> {
        Ok(self.store.put_response(entry).await?)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheTierError> {
        Ok(self.store.purge_expired(now).await?)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub lookups: u64,
    pub fast_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            return 0.0;
        }
        (self.fast_hits + self.durable_hits) as f64 / self.lookups as f64
    }
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    fast_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
}

// ---------------------------------------------------------------------------
// ResponseCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub response: String,
    /// Name of the tier that answered.
    pub tier: &'static str,
}

pub struct ResponseCache {
    enabled: bool,
    fast: MemoryTier,
    durable: Option<Box<dyn CacheTier>>,
    default_ttl: Duration,
    clock: SharedClock,
    counters: Counters,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, store: Option<Arc<dyn ResponseStore>>, clock: SharedClock) -> Self {
        let durable = match store {
            Some(store) if config.durable => {
                Some(Box::new(DurableTier::new(store)) as Box<dyn CacheTier>)
            }
            _ => None,
        };
        Self {
            enabled: config.enabled,
            fast: MemoryTier::new(config.fast_tier_max_entries),
            durable,
            default_ttl: Duration::seconds(config.default_ttl_secs.min(MAX_TTL_SECS) as i64),
            clock,
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Hex SHA-256 of prompt and model key, NUL separated.
    pub fn key(prompt: &str, model_key: &str) -> String {
        let mut input = Vec::with_capacity(prompt.len() + model_key.len() + 1);
        input.extend_from_slice(prompt.as_bytes());
        input.push(0);
        input.extend_from_slice(model_key.as_bytes());
        digest(&SHA256, &input)
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        if !self.enabled {
            return None;
        }
        let now = self.clock.now();
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        match self.fast.get(key, now).await {
            Ok(Some(entry)) => {
                self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
                return Some(CacheHit {
                    response: entry.response,
                    tier: self.fast.name(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!(tier = self.fast.name(), error = %e, "cache read failed"),
        }

        if let Some(durable) = &self.durable {
            match durable.get(key, now).await {
                Ok(Some(entry)) => {
                    self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.fast.put(&entry).await {
                        debug!(error = %e, "fast tier repopulation failed");
                    }
                    return Some(CacheHit {
                        response: entry.response,
                        tier: durable.name(),
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(tier = durable.name(), error = %e, "cache read failed"),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Build an entry expiring `ttl` from now (the default TTL when `None`).
    pub fn entry_for(&self, key: &str, response: &str, ttl: Option<Duration>) -> CacheEntry {
        let now = self.clock.now();
        CacheEntry {
            key: key.to_string(),
            response: response.to_string(),
            hit_count: 0,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            last_accessed: now,
        }
    }

    /// Write to both tiers. Empty responses are never cached.
    pub async fn store(&self, key: &str, response: &str, ttl: Option<Duration>) -> Result<(), CacheTierError> {
        if !self.enabled || response.is_empty() {
            return Ok(());
        }
        let entry = self.entry_for(key, response, ttl);
        self.fast.put(&entry).await?;
        self.store_durable(&entry).await
    }

    /// Write to the fast tier only. Used on the request path, where the
    /// durable write is handed to the background writer.
    pub async fn store_fast(&self, entry: &CacheEntry) {
        if !self.enabled || entry.response.is_empty() {
            return;
        }
        if let Err(e) = self.fast.put(entry).await {
            debug!(error = %e, "fast tier write failed");
        }
    }

    pub async fn store_durable(&self, entry: &CacheEntry) -> Result<(), CacheTierError> {
        if !self.enabled || entry.response.is_empty() {
            return Ok(());
        }
        match &self.durable {
            Some(durable) => durable.put(entry).await,
            None => Ok(()),
        }
    }

    /// Sweep both tiers. Failures are logged and count as nothing purged.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        let tiers: [Option<&dyn CacheTier>; 2] = [Some(&self.fast), self.durable.as_deref()];
        for tier in tiers.into_iter().flatten() {
            match tier.purge_expired(now).await {
                Ok(n) => purged += n,
                Err(e) => warn!(tier = tier.name(), error = %e, "cache purge failed"),
            }
        }
        if purged > 0 {
            debug!(purged, "expired cache entries removed");
        }
        purged
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    pub async fn fast_len(&self) -> usize {
        self.fast.len().await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            fast_hits: self.counters.fast_hits.load(Ordering::Relaxed),
            durable_hits: self.counters.durable_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sb_core::clock::ManualClock;

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap())
    }

    fn memory_only(clock: &ManualClock, max_entries: usize) -> ResponseCache {
        let config = CacheConfig {
            fast_tier_max_entries: max_entries,
            ..CacheConfig::default()
        };
        ResponseCache::new(&config, None, Arc::new(clock.clone()))
    }

    #[test]
    fn key_depends_on_prompt_and_model() {
        let a = ResponseCache::key("hello", "llama3.2:latest");
        assert_eq!(a.len(), 64);
        assert_eq!(a, ResponseCache::key("hello", "llama3.2:latest"));
        assert_ne!(a, ResponseCache::key("hello", "mistral:latest"));
        assert_ne!(a, ResponseCache::key("hello2", "llama3.2:latest"));
        // separator keeps ("ab","c") and ("a","bc") apart
        assert_ne!(ResponseCache::key("ab", "c"), ResponseCache::key("a", "bc"));
    }

    #[tokio::test]
    async fn entries_expire_on_the_clock() {
        let clock = clock();
        let cache = memory_only(&clock, 10);
        let key = ResponseCache::key("p", "m");
        cache.store(&key, "answer", Some(Duration::seconds(60))).await.unwrap();

        clock.advance(Duration::seconds(59));
        assert_eq!(cache.get(&key).await.unwrap().response, "answer");

        clock.advance(Duration::seconds(1));
        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.fast_len().await, 0);
    }

    #[tokio::test]
    async fn purge_sweeps_expired_entries() {
        let clock = clock();
        let cache = memory_only(&clock, 10);
        cache.store("short", "s", Some(Duration::seconds(10))).await.unwrap();
        cache.store("long", "l", Some(Duration::hours(1))).await.unwrap();
        clock.advance(Duration::minutes(1));
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.fast_len().await, 1);
    }

    #[tokio::test]
    async fn empty_responses_are_not_cached() {
        let clock = clock();
        let cache = memory_only(&clock, 10);
        let key = ResponseCache::key("p", "m");
        cache.store(&key, "", None).await.unwrap();
        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn full_tier_evicts_least_hit() {
        let clock = clock();
        let cache = memory_only(&clock, 2);
        cache.store("a", "A", None).await.unwrap();
        cache.store("b", "B", None).await.unwrap();
        assert!(cache.get("a").await.is_some());

        cache.store("c", "C", None).await.unwrap();
        assert_eq!(cache.fast_len().await, 2);
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn disabled_cache_is_inert() {
        let clock = clock();
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(&config, None, Arc::new(clock));
        cache.store("k", "v", None).await.unwrap();
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().lookups, 0);
    }

    #[test]
    fn hit_rate() {
        let stats = CacheStats {
            lookups: 4,
            fast_hits: 1,
            durable_hits: 1,
            misses: 2,
        };
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
