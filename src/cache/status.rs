//! Status Reporter
//!
//! Read-only introspection for operators plus the administrative warm-up.
//! Nothing here raises on a single bad filename; every item gets its own
//! outcome.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use super::capacity::CacheStats;
use super::downloader::DownloadStats;
use super::key::normalize;
use super::{epoch_millis, MediaCache};
use crate::origin::ErrorEntry;

/// Counters for requests reaching the proxy
#[derive(Debug, Default)]
pub struct RequestCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    partial: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub partial_responses: u64,
    pub errors: u64,
}

impl RequestCounters {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial(&self) {
        self.partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            partial_responses: self.partial.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Cache state of one logical filename
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Milliseconds since the Unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<u64>,
    /// Seconds since the file was downloaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmFailure {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmReport {
    /// Filenames present in the cache afterwards, downloaded or not
    pub cached_count: usize,
    pub failures: Vec<WarmFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginStatus {
    pub health: &'static str,
    pub recent_errors: Vec<ErrorEntry>,
}

/// Everything `GET /cache/stats` reports
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    #[serde(flatten)]
    pub usage: CacheStats,
    pub requests: CounterSnapshot,
    pub downloads: DownloadStats,
    pub negative_cache_hits: u64,
    pub origin: OriginStatus,
}

impl MediaCache {
    /// Cached/not-cached for each filename. Invalid names are reported as
    /// not cached. Does not count as an access.
    pub fn status_for(&self, filenames: &[String]) -> BTreeMap<String, FileStatus> {
        filenames
            .iter()
            .map(|filename| {
                let entry = normalize(filename)
                    .ok()
                    .and_then(|key| self.store().peek(&key));
                let status = match entry {
                    Some(entry) => FileStatus {
                        cached: true,
                        size_bytes: Some(entry.size_bytes),
                        cached_at: Some(epoch_millis(entry.cached_at)),
                        last_accessed_at: Some(epoch_millis(entry.last_accessed_at)),
                        age_secs: Some(
                            SystemTime::now()
                                .duration_since(entry.cached_at)
                                .map_or(0, |age| age.as_secs()),
                        ),
                    },
                    None => FileStatus::default(),
                };
                (filename.clone(), status)
            })
            .collect()
    }

    /// Download every filename not yet cached, a few at a time
    pub async fn force_cache(&self, filenames: Vec<String>) -> WarmReport {
        let total = filenames.len();
        let outcomes: Vec<(String, Result<(), String>)> = stream::iter(filenames)
            .map(|filename| async move {
                let outcome = match normalize(&filename) {
                    Ok(key) => self.warm(&key).await.map(|_| ()).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                (filename, outcome)
            })
            .buffer_unordered(self.warm_concurrency())
            .collect()
            .await;

        let mut report = WarmReport::default();
        for (filename, outcome) in outcomes {
            match outcome {
                Ok(()) => report.cached_count += 1,
                Err(error) => {
                    debug!(filename = %filename, error = %error, "Warm-up failed");
                    report.failures.push(WarmFailure { filename, error });
                }
            }
        }
        report.failures.sort_by(|a, b| a.filename.cmp(&b.filename));

        info!(
            requested = total,
            cached = report.cached_count,
            failed = report.failures.len(),
            "Cache warm-up finished"
        );
        report
    }

    /// Warm every media object the origin lists
    pub async fn force_cache_all(&self) -> Result<WarmReport, crate::b2::OriginError> {
        let keys = self.origin().list_keys(None).await?;
        let media: Vec<String> = keys
            .into_iter()
            .filter(|key| normalize(key).is_ok())
            .collect();
        info!(objects = media.len(), "Warming every media object in the bucket");
        Ok(self.force_cache(media).await)
    }

    pub fn full_stats(&self) -> StatsReport {
        StatsReport {
            usage: self.stats(),
            requests: self.counters().snapshot(),
            downloads: self.downloader().stats(),
            negative_cache_hits: self.downloader().negative_cache_hits(),
            origin: OriginStatus {
                health: self.origin().health_status(),
                recent_errors: self.origin().recent_errors(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{cache_with, payload};
    use crate::origin::fake::FakeOrigin;

    #[tokio::test]
    async fn test_status_for_reports_cached_and_missing() {
        let (_dir, _origin, cache) =
            cache_with(FakeOrigin::default().with_object("hero.webp", payload(64)));

        cache.force_cache(vec!["hero.webp".to_string()]).await;
        let status = cache.status_for(&[
            "hero.webp".to_string(),
            "other.mp4".to_string(),
            "../etc/passwd".to_string(),
        ]);

        let hero = &status["hero.webp"];
        assert!(hero.cached);
        assert_eq!(hero.size_bytes, Some(64));
        assert!(hero.cached_at.is_some());
        assert_eq!(status["other.mp4"], FileStatus::default());
        assert!(!status["../etc/passwd"].cached);
    }

    #[tokio::test]
    async fn test_force_cache_reports_each_item() {
        let (_dir, origin, cache) = cache_with(
            FakeOrigin::default()
                .with_object("gallery%20walk.mp4", payload(10))
                .with_object("hero.webp", payload(20)),
        );

        let report = cache
            .force_cache(vec![
                "gallery_walk.mp4".to_string(),
                "hero.webp".to_string(),
                "missing.png".to_string(),
                "notes.txt".to_string(),
            ])
            .await;

        assert_eq!(report.cached_count, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].filename, "missing.png");
        assert_eq!(report.failures[1].filename, "notes.txt");
        assert!(report.failures[1].error.contains("Invalid filename"));
        assert_eq!(origin.calls(), 3);

        // Already cached entries are not downloaded again
        let again = cache.force_cache(vec!["hero.webp".to_string()]).await;
        assert_eq!(again.cached_count, 1);
        assert_eq!(origin.calls(), 3);
    }

    #[tokio::test]
    async fn test_force_cache_all_warms_listed_media() {
        let (_dir, _origin, cache) = cache_with(
            FakeOrigin::default()
                .with_object("videos/intro.mp4", payload(10))
                .with_object("hero.webp", payload(20))
                .with_object("readme.txt", payload(5)),
        );

        let report = cache.force_cache_all().await.unwrap();
        assert_eq!(report.cached_count, 2);
        assert!(report.failures.is_empty());
        assert_eq!(cache.stats().total.count, 2);
    }

    #[tokio::test]
    async fn test_full_stats_serializes_flat_usage() {
        let (_dir, _origin, cache) =
            cache_with(FakeOrigin::default().with_object("hero.webp", payload(20)));
        cache.force_cache(vec!["hero.webp".to_string()]).await;

        let json = serde_json::to_value(cache.full_stats()).unwrap();
        assert_eq!(json["image"]["count"], 1);
        assert_eq!(json["image"]["sizeBytes"], 20);
        assert_eq!(json["video"]["count"], 0);
        assert_eq!(json["downloads"]["originFetches"], 1);
        assert_eq!(json["origin"]["health"], "healthy");
    }
}
