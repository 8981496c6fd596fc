//! TTL caches for run handles.
//!
//! Repeated access to the same run is the common case, so built runs are
//! cached. Two tiers with independent eviction rules reflect the run
//! lifecycle: *complete* runs (stop document present) change rarely and
//! get a long TTL, *live* runs are likely to grow soon and get a short
//! one. There is no explicit promotion from live to complete; the short
//! TTL bounds the staleness window, after which a rebuild lands the run in
//! the complete tier.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A TTL + size bounded map with FIFO eviction and hit/miss statistics.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
    ttl: Duration,
    max_entries: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Fetch a live entry, expiring it if the TTL has lapsed.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return None,
        };
        match entries.get(key) {
            Some((value, inserted_at)) if inserted_at.elapsed() < self.ttl => {
                self.stats.record_hit();
                Some(value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.stats.record_miss();
                None
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        // Drop anything expired first, then the oldest insertion if still
        // over capacity.
        let ttl = self.ttl;
        entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() < ttl);
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, inserted_at))| *inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => entries.remove(&k),
                None => break,
            };
        }
        entries.insert(key, (value, Instant::now()));
    }

    pub fn remove(&self, key: &K) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }
}

/// Cache hit/miss counters for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicUsize::new(self.hits.load(Ordering::Relaxed)),
            misses: AtomicUsize::new(self.misses.load(Ordering::Relaxed)),
        }
    }
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

/// The two-tier run cache, keyed by RunStart uid.
pub struct RunCache<V> {
    complete: TtlCache<String, V>,
    live: TtlCache<String, V>,
}

impl<V: Clone> RunCache<V> {
    pub fn new(ttl_complete: Duration, ttl_live: Duration, max_entries: usize) -> Self {
        Self {
            complete: TtlCache::new(ttl_complete, max_entries),
            live: TtlCache::new(ttl_live, max_entries),
        }
    }

    /// Probe the complete tier first, then the live tier.
    pub fn get(&self, uid: &str) -> Option<V> {
        self.complete
            .get(&uid.to_string())
            .or_else(|| self.live.get(&uid.to_string()))
    }

    /// Place a freshly built run into the tier matching its lifecycle
    /// state.
    pub fn insert(&self, uid: &str, value: V, is_complete: bool) {
        if is_complete {
            self.complete.insert(uid.to_string(), value);
        } else {
            self.live.insert(uid.to_string(), value);
        }
    }

    pub fn stats(&self) -> (CacheStats, CacheStats) {
        (self.complete.stats(), self.live.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_within_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.stats().hits(), 1);
    }

    #[test]
    fn test_expiry_after_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(0), 10);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert(1, 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2, 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn test_two_tier_probe_order() {
        let cache: RunCache<&'static str> = RunCache::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            10,
        );
        cache.insert("run", "live-build", false);
        assert_eq!(cache.get("run"), Some("live-build"));
        cache.insert("run", "complete-build", true);
        // The complete tier wins the probe.
        assert_eq!(cache.get("run"), Some("complete-build"));
    }
}
