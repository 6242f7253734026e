//! Media cache
//!
//! Keeps full copies of bucket objects on local disk so the proxy can answer
//! range requests by seeking a local file. `MediaCache` ties the pieces
//! together: normalizer, on-disk store, deduplicating downloader, capacity
//! management and status reporting.

pub mod capacity;
pub mod downloader;
pub mod key;
pub mod missing;
pub mod status;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::config::Config;
use crate::origin::ObjectStore;

pub use capacity::{CacheStats, CapacityManager, ClearReport};
pub use downloader::{Downloader, FetchError};
pub use key::{normalize, CanonicalKey, KeyError, MediaCategory};
pub use status::{RequestCounters, StatsReport, WarmReport};
pub use store::{CacheEntry, CacheStore, StoreError};

/// Milliseconds since the Unix epoch
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Cache tuning, usually taken from `Config`
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub max_bytes: u64,
    pub auto_evict: bool,
    pub fetch_attempts: u32,
    pub retry_backoff: Duration,
    pub not_found_ttl: Duration,
    pub warm_concurrency: usize,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.cache_root.clone(),
            max_bytes: config.max_cache_bytes,
            auto_evict: config.auto_evict,
            fetch_attempts: config.fetch_attempts,
            retry_backoff: Duration::from_millis(500),
            not_found_ttl: config.not_found_ttl,
            warm_concurrency: config.warm_concurrency,
        }
    }
}

pub struct MediaCache {
    store: Arc<CacheStore>,
    downloader: Arc<Downloader>,
    capacity: CapacityManager,
    counters: RequestCounters,
    auto_evict: bool,
    warm_concurrency: usize,
}

impl MediaCache {
    /// Open the on-disk cache and wire it to `origin`
    pub fn open(settings: CacheSettings, origin: Arc<dyn ObjectStore>) -> Result<Self, StoreError> {
        let store = Arc::new(CacheStore::open(&settings.root)?);
        let downloader = Downloader::new(
            origin,
            Arc::clone(&store),
            settings.fetch_attempts,
            settings.not_found_ttl,
        )
        .with_backoff(settings.retry_backoff);

        Ok(Self {
            capacity: CapacityManager::new(Arc::clone(&store), settings.max_bytes),
            downloader: Arc::new(downloader),
            store,
            counters: RequestCounters::default(),
            auto_evict: settings.auto_evict,
            warm_concurrency: settings.warm_concurrency.max(1),
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn origin(&self) -> &Arc<dyn ObjectStore> {
        self.downloader.origin()
    }

    pub fn counters(&self) -> &RequestCounters {
        &self.counters
    }

    pub fn warm_concurrency(&self) -> usize {
        self.warm_concurrency
    }

    /// Resolve a key for a viewer request: local hit, or download first.
    /// Counts the hit or miss.
    pub async fn resolve(&self, key: &CanonicalKey) -> Result<CacheEntry, FetchError> {
        if let Some(entry) = self.store.lookup(key) {
            self.counters.record_hit();
            debug!(key = %key, "Media cache HIT");
            return Ok(entry);
        }

        self.counters.record_miss();
        debug!(key = %key, "Media cache MISS, fetching from origin");
        let entry = self.downloader.fetch(key).await?;
        self.settle(&entry);
        Ok(entry)
    }

    /// Make sure a key is cached without counting a viewer request.
    /// Returns whether a download was needed.
    pub async fn warm(&self, key: &CanonicalKey) -> Result<bool, FetchError> {
        if self.store.peek(key).is_some() {
            return Ok(false);
        }
        let entry = self.downloader.fetch(key).await?;
        self.settle(&entry);
        Ok(true)
    }

    fn settle(&self, entry: &CacheEntry) {
        if self.auto_evict {
            self.capacity.evict_if_over_limit(Some(&entry.cache_id));
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.capacity.stats()
    }

    /// Remove cached files of one category (or all) and forget remembered 404s
    pub fn clear(&self, category: Option<MediaCategory>) -> ClearReport {
        let report = self.capacity.clear(category);
        self.downloader.forget_missing();
        report
    }
}
