//! Capacity Manager
//!
//! Aggregate usage reporting plus the two ways entries leave the cache: an
//! explicit operator `clear`, and optional LRU eviction against the
//! configured ceiling.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::key::MediaCategory;
use super::store::{CacheEntry, CacheStore};

/// Entry count and bytes for one slice of the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub count: usize,
    pub size_bytes: u64,
}

impl Usage {
    fn add(&mut self, entry: &CacheEntry) {
        self.count += 1;
        self.size_bytes += entry.size_bytes;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub video: Usage,
    pub image: Usage,
    pub total: Usage,
    pub limit_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub removed_count: usize,
    pub removed_bytes: u64,
}

pub struct CapacityManager {
    store: Arc<CacheStore>,
    limit_bytes: u64,
}

impl CapacityManager {
    pub fn new(store: Arc<CacheStore>, limit_bytes: u64) -> Self {
        Self { store, limit_bytes }
    }

    /// Usage grouped by category, computed from the live index
    pub fn stats(&self) -> CacheStats {
        let mut video = Usage::default();
        let mut image = Usage::default();
        let mut total = Usage::default();
        for entry in self.store.list(None) {
            match entry.category {
                MediaCategory::Video => video.add(&entry),
                MediaCategory::Image => image.add(&entry),
            }
            total.add(&entry);
        }

        let usage_percent = if self.limit_bytes == 0 {
            0.0
        } else {
            let percent = total.size_bytes as f64 / self.limit_bytes as f64 * 100.0;
            (percent * 100.0).round() / 100.0
        };

        CacheStats {
            video,
            image,
            total,
            limit_bytes: self.limit_bytes,
            usage_percent,
        }
    }

    /// Delete every entry of `category`, or everything when `None`.
    ///
    /// Entries whose file cannot be removed stay indexed and are skipped.
    pub fn clear(&self, category: Option<MediaCategory>) -> ClearReport {
        let mut report = ClearReport::default();
        for entry in self.store.list(category) {
            match self.store.remove_id(&entry.cache_id) {
                Ok(Some(removed)) => {
                    report.removed_count += 1;
                    report.removed_bytes += removed.size_bytes;
                }
                Ok(None) => {}
                Err(e) => warn!(cache_id = %entry.cache_id, error = %e, "Failed to clear cached file"),
            }
        }

        info!(
            category = category.map_or("all", |c| c.as_str()),
            removed = report.removed_count,
            removed_mb = report.removed_bytes / (1024 * 1024),
            "Cache cleared"
        );
        report
    }

    /// Evict least recently accessed entries until usage fits the ceiling.
    ///
    /// `protect` names a cache id that must survive, typically the entry
    /// that was just downloaded for a waiting request.
    pub fn evict_if_over_limit(&self, protect: Option<&str>) -> ClearReport {
        let mut report = ClearReport::default();
        let mut entries = self.store.list(None);
        let total_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if total_size <= self.limit_bytes {
            return report;
        }

        info!(
            total_mb = total_size / (1024 * 1024),
            max_mb = self.limit_bytes / (1024 * 1024),
            "Cache exceeds max size, evicting LRU entries"
        );

        // Oldest access first
        entries.sort_by(|a, b| a.last_accessed_at.cmp(&b.last_accessed_at));

        let target = total_size - self.limit_bytes;
        for entry in entries {
            if report.removed_bytes >= target {
                break;
            }
            if protect == Some(entry.cache_id.as_str()) {
                continue;
            }
            match self.store.remove_id(&entry.cache_id) {
                Ok(Some(removed)) => {
                    debug!(cache_id = %removed.cache_id, size = removed.size_bytes, "Evicted cached file");
                    report.removed_count += 1;
                    report.removed_bytes += removed.size_bytes;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %entry.local_path.display(), error = %e, "Failed to evict cached file")
                }
            }
        }
        report
    }
}
