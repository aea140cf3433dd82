//! Response cache
//!
//! Bounded LRU cache of generated outputs keyed by prompts, model identity and
//! the full sampling parameter set. Inserts are skipped while the memory
//! governor reports pressure.

use crate::memory::MemoryGovernor;
use crate::request::{GenerationRequest, ParamsKey};
use lru::LruCache;
use modelserve_common::config::CacheConfig;
use modelserve_common::METRICS;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Identity of a cached generation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub prompts: Vec<String>,
    pub model_name: String,
    pub version: String,
    pub params: ParamsKey,
}

impl CacheKey {
    /// Key for `request` once its model and version are resolved
    pub fn for_request(request: &GenerationRequest, model_name: &str, version: &str) -> Self {
        Self {
            prompts: request.prompts.clone(),
            model_name: model_name.to_string(),
            version: version.to_string(),
            params: request.params.key(),
        }
    }
}

/// Cached generation output
#[derive(Debug, Clone, PartialEq)]
pub struct CachedGeneration {
    pub texts: Vec<String>,
    pub token_count: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedGeneration,
    inserted_at: Instant,
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub skipped: u64,
    pub entries: usize,
    pub capacity: usize,
}

/// Bounded LRU response cache
pub struct ResponseCache {
    enabled: bool,
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Option<Duration>,
    governor: Option<Arc<MemoryGovernor>>,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped: AtomicU64,
}

impl ResponseCache {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: true,
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: None,
            governor: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig, governor: Arc<MemoryGovernor>) -> Self {
        let mut cache = Self::new(config.capacity).with_governor(governor);
        cache.enabled = config.enabled;
        cache.ttl = config.ttl();
        cache
    }

    /// Expire entries older than `ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Skip inserts while `governor` reports pressure
    pub fn with_governor(mut self, governor: Arc<MemoryGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up `key`, refreshing its recency on a hit
    pub fn get(&self, key: &CacheKey) -> Option<CachedGeneration> {
        if !self.enabled {
            return None;
        }

        let lookup = {
            let mut entries = self.entries.lock();
            let lookup = entries
                .get(key)
                .map(|entry| (!self.is_expired(entry)).then(|| entry.value.clone()));
            if let Some(None) = lookup {
                entries.pop(key);
            }
            lookup
        };

        if let Some(Some(value)) = lookup {
            self.hits.fetch_add(1, Ordering::Relaxed);
            METRICS.engine.cache_hits.inc();
            trace!("Cache hit for {}:{}", key.model_name, key.version);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        METRICS.engine.cache_misses.inc();
        None
    }

    /// Whether the attached governor currently reports pressure
    pub fn under_pressure(&self) -> bool {
        self.governor
            .as_ref()
            .is_some_and(|governor| governor.should_evict())
    }

    /// Insert `value`; returns false when the insert was skipped
    pub fn put(&self, key: CacheKey, value: CachedGeneration) -> bool {
        if !self.enabled {
            return false;
        }
        self.put_unless(self.under_pressure(), key, value)
    }

    /// Insert `value` unless `under_pressure`, using a pressure reading the
    /// caller already took
    pub fn put_unless(&self, under_pressure: bool, key: CacheKey, value: CachedGeneration) -> bool {
        if !self.enabled {
            return false;
        }

        if under_pressure {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            METRICS.engine.cache_skips.inc();
            debug!("Skipping cache insert under memory pressure");
            return false;
        }

        self.entries.lock().put(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };

        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }

        if !expired.is_empty() {
            debug!("Purged {} expired cache entries", expired.len());
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            entries: entries.len(),
            capacity: entries.cap().get(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .map(|ttl| entry.inserted_at.elapsed() >= ttl)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FixedMemorySource;
    use crate::request::SamplingParams;
    use crate::test_support::governor;

    fn key(prompt: &str, temperature: f32) -> CacheKey {
        let request = GenerationRequest::new(
            vec![prompt.to_string()],
            SamplingParams {
                temperature,
                ..SamplingParams::default()
            },
        );
        CacheKey::for_request(&request, "demo", "1.0")
    }

    fn value(text: &str) -> CachedGeneration {
        CachedGeneration {
            texts: vec![text.to_string()],
            token_count: 1,
        }
    }

    #[test]
    fn test_get_and_put() {
        let cache = ResponseCache::new(4);
        assert!(cache.get(&key("hello", 0.7)).is_none());

        assert!(cache.put(key("hello", 0.7), value("hello world")));
        assert_eq!(cache.get(&key("hello", 0.7)), Some(value("hello world")));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_temperature_separates_entries() {
        let cache = ResponseCache::new(4);
        assert_ne!(key("hello", 0.5), key("hello", 0.9));

        cache.put(key("hello", 0.5), value("cool"));
        cache.put(key("hello", 0.9), value("warm"));

        assert_eq!(cache.get(&key("hello", 0.5)), Some(value("cool")));
        assert_eq!(cache.get(&key("hello", 0.9)), Some(value("warm")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResponseCache::new(2);
        cache.put(key("a", 0.7), value("a"));
        cache.put(key("b", 0.7), value("b"));

        // Touch "a" so "b" becomes least recently used
        assert!(cache.get(&key("a", 0.7)).is_some());
        cache.put(key("c", 0.7), value("c"));

        assert!(cache.get(&key("a", 0.7)).is_some());
        assert!(cache.get(&key("b", 0.7)).is_none());
        assert!(cache.get(&key("c", 0.7)).is_some());
        assert_eq!(cache.stats().capacity, 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResponseCache::new(4).with_ttl(Duration::ZERO);
        cache.put(key("hello", 0.7), value("x"));

        assert!(cache.get(&key("hello", 0.7)).is_none());
        assert!(cache.is_empty());

        cache.put(key("again", 0.7), value("y"));
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_skip_under_pressure() {
        let source = Arc::new(FixedMemorySource::new(10.0, 95, 100));
        let cache = ResponseCache::new(4).with_governor(governor(source.clone()));

        assert!(!cache.put(key("hello", 0.7), value("x")));
        assert_eq!(cache.stats().skipped, 1);
        assert!(cache.is_empty());

        source.set_device_used(10);
        assert!(cache.put(key("hello", 0.7), value("x")));
    }

    #[test]
    fn test_put_unless_uses_given_reading() {
        let source = Arc::new(FixedMemorySource::new(10.0, 95, 100));
        let cache = ResponseCache::new(4).with_governor(governor(source.clone()));
        assert!(cache.under_pressure());

        // The caller's reading wins over a fresh sample
        assert!(cache.put_unless(false, key("a", 0.7), value("a")));
        source.set_device_used(10);
        assert!(!cache.under_pressure());
        assert!(!cache.put_unless(true, key("b", 0.7), value("b")));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().skipped, 1);
    }

    #[test]
    fn test_disabled_cache() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = ResponseCache::from_config(&config, governor(Default::default()));

        assert!(!cache.put(key("hello", 0.7), value("x")));
        assert!(cache.get(&key("hello", 0.7)).is_none());
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_clear() {
        let cache = ResponseCache::new(4);
        cache.put(key("a", 0.7), value("a"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
