//! Negative cache for objects the origin reported missing
//!
//! Uses Moka with a TTL so a broken link on a popular page does not turn
//! every page view into an origin round-trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::sync::Cache;
use tracing::{debug, trace};

use super::key::CanonicalKey;

/// Upper bound on remembered misses
const MAX_ENTRIES: u64 = 10_000;

pub struct MissingCache {
    /// Cache ids known to be absent remotely; None when disabled
    cache: Option<Cache<String, ()>>,
    hits: AtomicU64,
}

impl MissingCache {
    /// Create a cache remembering misses for `ttl`; a zero TTL disables it
    pub fn new(ttl: Duration) -> Self {
        let cache = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .time_to_live(ttl)
                .max_capacity(MAX_ENTRIES)
                .name("origin_not_found_cache")
                .build()
        });

        Self {
            cache,
            hits: AtomicU64::new(0),
        }
    }

    /// Whether the origin recently answered 404 for this key
    pub fn contains(&self, key: &CanonicalKey) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let hit = cache.contains_key(key.cache_id());
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Negative cache HIT");
        }
        hit
    }

    pub fn insert(&self, key: &CanonicalKey) {
        if let Some(cache) = &self.cache {
            cache.insert(key.cache_id().to_string(), ());
            debug!(key = %key, "Remembering missing object");
        }
    }

    /// Forget every remembered miss
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        self.hits.store(0, Ordering::Relaxed);
    }

    /// Number of requests answered from the negative cache
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::normalize;

    #[test]
    fn test_insert_and_clear() {
        let missing = MissingCache::new(Duration::from_secs(60));
        let key = normalize("gone.mp4").unwrap();

        assert!(!missing.contains(&key));
        missing.insert(&key);
        assert!(missing.contains(&key));
        assert_eq!(missing.hits(), 1);

        missing.clear();
        assert!(!missing.contains(&key));
        assert_eq!(missing.hits(), 0);
    }

    #[test]
    fn test_zero_ttl_disables() {
        let missing = MissingCache::new(Duration::ZERO);
        let key = normalize("gone.mp4").unwrap();
        missing.insert(&key);
        assert!(!missing.contains(&key));
    }

    #[test]
    fn test_entries_expire() {
        let missing = MissingCache::new(Duration::from_millis(50));
        let key = normalize("gone.mp4").unwrap();
        missing.insert(&key);
        std::thread::sleep(Duration::from_millis(120));
        assert!(!missing.contains(&key));
    }
}
