//! Origin Downloader
//!
//! Pulls whole objects from the origin into the Cache Store. Concurrent
//! requests for the same key share a single download: the first caller
//! registers an in-flight future, everyone else awaits that same future and
//! sees the same outcome.
//!
//! The transfer runs in its own task, so a viewer disconnecting does not
//! cancel a download other viewers are waiting on. Bytes are streamed into
//! a staging file and renamed into place only once complete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::key::CanonicalKey;
use super::missing::MissingCache;
use super::store::{CacheEntry, CacheStore};
use crate::b2::OriginError;
use crate::origin::{ObjectBody, ObjectStore};

/// Delay before the first retry; doubles on each further attempt
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Outcome of a failed fetch, shared by every waiter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Object not found at origin: {0}")]
    OriginNotFound(String),

    #[error("Origin unreachable: {0}")]
    OriginUnreachable(String),

    #[error("Failed to write cache file: {0}")]
    WriteFailure(String),
}

/// Why a single attempt failed
enum AttemptError {
    Origin(OriginError),
    Write(String),
}

impl AttemptError {
    fn into_fetch_error(self, key: &CanonicalKey) -> FetchError {
        match self {
            AttemptError::Origin(OriginError::NotFound(_)) => {
                FetchError::OriginNotFound(key.to_string())
            }
            AttemptError::Origin(e) => FetchError::OriginUnreachable(e.to_string()),
            AttemptError::Write(e) => FetchError::WriteFailure(e),
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry, FetchError>>>;

/// Download counters for the status endpoints
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    pub origin_fetches: u64,
    pub joined_downloads: u64,
    pub failed_downloads: u64,
    pub in_flight: usize,
}

pub struct Downloader {
    origin: Arc<dyn ObjectStore>,
    store: Arc<CacheStore>,
    missing: MissingCache,
    /// In-flight downloads by cache id
    inflight: Mutex<HashMap<String, SharedFetch>>,
    max_attempts: u32,
    backoff: Duration,
    origin_fetches: AtomicU64,
    joined_downloads: AtomicU64,
    failed_downloads: AtomicU64,
}

/// Removes the in-flight registration when the download task ends, even by panic
struct InflightGuard {
    downloader: Arc<Downloader>,
    cache_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.downloader.inflight.lock().remove(&self.cache_id);
    }
}

impl Downloader {
    pub fn new(
        origin: Arc<dyn ObjectStore>,
        store: Arc<CacheStore>,
        max_attempts: u32,
        not_found_ttl: Duration,
    ) -> Self {
        Self {
            origin,
            store,
            missing: MissingCache::new(not_found_ttl),
            inflight: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            backoff: DEFAULT_BACKOFF,
            origin_fetches: AtomicU64::new(0),
            joined_downloads: AtomicU64::new(0),
            failed_downloads: AtomicU64::new(0),
        }
    }

    /// Override the initial retry delay
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn origin(&self) -> &Arc<dyn ObjectStore> {
        &self.origin
    }

    /// Make sure `key` is in the cache, downloading it at most once no
    /// matter how many callers ask concurrently
    ///
    /// # Arguments
    /// * `key` - Normalized key; its URL path is what the origin is asked for
    ///
    /// # Returns
    /// The committed entry, or the one failure every concurrent caller shares
    pub async fn fetch(self: &Arc<Self>, key: &CanonicalKey) -> Result<CacheEntry, FetchError> {
        let pending = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key.cache_id()) {
                Some(existing) => {
                    self.joined_downloads.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Joining in-flight download");
                    existing.clone()
                }
                None => {
                    // A download may have committed since the caller's miss
                    if let Some(entry) = self.store.peek(key) {
                        return Ok(entry);
                    }
                    let shared = self.spawn_download(key.clone());
                    inflight.insert(key.cache_id().to_string(), shared.clone());
                    shared
                }
            }
        };

        pending.await
    }

    /// Forget remembered origin 404s
    pub fn forget_missing(&self) {
        self.missing.clear();
    }

    /// Requests answered from remembered 404s
    pub fn negative_cache_hits(&self) -> u64 {
        self.missing.hits()
    }

    pub fn stats(&self) -> DownloadStats {
        DownloadStats {
            origin_fetches: self.origin_fetches.load(Ordering::Relaxed),
            joined_downloads: self.joined_downloads.load(Ordering::Relaxed),
            failed_downloads: self.failed_downloads.load(Ordering::Relaxed),
            in_flight: self.inflight.lock().len(),
        }
    }

    /// Must be called with the in-flight lock held, so the task cannot
    /// deregister before it is registered.
    fn spawn_download(self: &Arc<Self>, key: CanonicalKey) -> SharedFetch {
        let guard = InflightGuard {
            downloader: Arc::clone(self),
            cache_id: key.cache_id().to_string(),
        };

        let task = tokio::spawn(async move {
            let result = guard.downloader.download_with_retry(&key).await;
            drop(guard);
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(FetchError::WriteFailure(format!("download task aborted: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    async fn download_with_retry(&self, key: &CanonicalKey) -> Result<CacheEntry, FetchError> {
        if self.missing.contains(key) {
            return Err(FetchError::OriginNotFound(key.to_string()));
        }

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download_once(key).await {
                Ok(entry) => {
                    info!(
                        key = %key,
                        size = entry.size_bytes,
                        attempt = attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Downloaded object into cache"
                    );
                    return Ok(entry);
                }
                Err(AttemptError::Origin(e)) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        key = %key,
                        attempt = attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying origin download"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    let err = failure.into_fetch_error(key);
                    if matches!(err, FetchError::OriginNotFound(_)) {
                        self.missing.insert(key);
                    }
                    self.failed_downloads.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, attempt = attempt, error = %err, "Origin download failed");
                    return Err(err);
                }
            }
        }
    }

    /// One transfer into a fresh staging file. Any error drops the staging
    /// file, which deletes it.
    async fn download_once(&self, key: &CanonicalKey) -> Result<CacheEntry, AttemptError> {
        self.origin_fetches.fetch_add(1, Ordering::Relaxed);
        let ObjectBody {
            content_length,
            mut stream,
        } = self
            .origin
            .get_object(&key.url_path())
            .await
            .map_err(AttemptError::Origin)?;

        let write_err = |e: std::io::Error| AttemptError::Write(e.to_string());
        let staged = self
            .store
            .stage()
            .map_err(|e| AttemptError::Write(e.to_string()))?;
        let (file, staged_path) = staged.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(AttemptError::Origin)?;
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        if let Some(expected) = content_length {
            if expected != written {
                return Err(AttemptError::Origin(OriginError::Network(format!(
                    "transfer ended after {} of {} bytes",
                    written, expected
                ))));
            }
        }

        self.store
            .commit(key, staged_path, written)
            .map_err(|e| AttemptError::Write(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::normalize;
    use crate::origin::fake::{Failure, FakeOrigin};
    use std::fs;
    use std::path::Path;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn setup(origin: FakeOrigin) -> (tempfile::TempDir, Arc<FakeOrigin>, Arc<Downloader>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::open(dir.path()).unwrap());
        let origin = Arc::new(origin);
        let downloader = Arc::new(
            Downloader::new(origin.clone(), store, 2, Duration::from_secs(60))
                .with_backoff(Duration::from_millis(5)),
        );
        (dir, origin, downloader)
    }

    fn files_in(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_download() {
        let bytes = payload(100_000);
        let (_dir, origin, downloader) = setup(
            FakeOrigin::default()
                .with_object("gallery%20walk.mp4", bytes.clone())
                .with_delay(Duration::from_millis(50)),
        );
        let key = normalize("gallery_walk.mp4").unwrap();

        let results =
            futures::future::join_all((0..8).map(|_| downloader.fetch(&key))).await;

        assert_eq!(origin.calls(), 1);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.size_bytes, bytes.len() as u64);
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
        assert_eq!(fs::read(&first.local_path).unwrap(), bytes);

        let stats = downloader.stats();
        assert_eq!(stats.origin_fetches, 1);
        assert_eq!(stats.joined_downloads, 7);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_identical() {
        let (_dir, origin, downloader) =
            setup(FakeOrigin::default().with_delay(Duration::from_millis(50)));
        let key = normalize("missing.mp4").unwrap();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let downloader = Arc::clone(&downloader);
                let key = key.clone();
                tokio::spawn(async move { downloader.fetch(&key).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(FetchError::OriginNotFound("missing.mp4".to_string()))
            );
        }
        // 404 is never retried
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_remembered_until_forgotten() {
        let (_dir, origin, downloader) = setup(FakeOrigin::default());
        let key = normalize("missing.png").unwrap();

        assert!(downloader.fetch(&key).await.is_err());
        assert!(downloader.fetch(&key).await.is_err());
        assert_eq!(origin.calls(), 1);

        downloader.forget_missing();
        assert!(downloader.fetch(&key).await.is_err());
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (_dir, origin, downloader) =
            setup(FakeOrigin::default().with_object("hero.webp", payload(10)));
        origin.fail_next(Failure::Unreachable);
        let key = normalize("hero.webp").unwrap();

        let entry = downloader.fetch(&key).await.unwrap();
        assert_eq!(entry.size_bytes, 10);
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (_dir, origin, downloader) =
            setup(FakeOrigin::default().with_object("hero.webp", payload(10)));
        for _ in 0..3 {
            origin.fail_next(Failure::Unreachable);
        }
        let key = normalize("hero.webp").unwrap();

        let err = downloader.fetch(&key).await.unwrap_err();
        assert!(matches!(err, FetchError::OriginUnreachable(_)));
        assert_eq!(origin.calls(), 2);
        assert_eq!(downloader.stats().failed_downloads, 1);
    }

    #[tokio::test]
    async fn test_mid_transfer_failure_leaves_no_files() {
        let bytes = payload(50_000);
        let (dir, origin, downloader) =
            setup(FakeOrigin::default().with_object("intro.mp4", bytes.clone()));
        origin.fail_next(Failure::MidTransfer(20_000));
        origin.fail_next(Failure::MidTransfer(30_000));
        let key = normalize("intro.mp4").unwrap();

        let err = downloader.fetch(&key).await.unwrap_err();
        assert!(matches!(err, FetchError::OriginUnreachable(_)));
        assert_eq!(files_in(&dir.path().join("video")), 0);
        assert_eq!(files_in(&dir.path().join(".staging")), 0);

        // The next request starts over from scratch
        let entry = downloader.fetch(&key).await.unwrap();
        assert_eq!(origin.calls(), 3);
        assert_eq!(fs::read(&entry.local_path).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_disk_failure_is_write_failure() {
        let bytes = payload(4_000);
        let (dir, origin, downloader) =
            setup(FakeOrigin::default().with_object("intro.mp4", bytes.clone()));
        let key = normalize("intro.mp4").unwrap();

        // A plain file where the category directory should be
        let video_dir = dir.path().join("video");
        fs::remove_dir(&video_dir).unwrap();
        fs::write(&video_dir, b"").unwrap();

        let err = downloader.fetch(&key).await.unwrap_err();
        assert!(matches!(err, FetchError::WriteFailure(_)));
        // Local errors are not retried
        assert_eq!(origin.calls(), 1);
        assert_eq!(files_in(&dir.path().join(".staging")), 0);
        assert_eq!(downloader.stats().failed_downloads, 1);

        fs::remove_file(&video_dir).unwrap();
        fs::create_dir(&video_dir).unwrap();
        let entry = downloader.fetch(&key).await.unwrap();
        assert_eq!(fs::read(&entry.local_path).unwrap(), bytes);
        assert_eq!(files_in(&video_dir), 1);
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_cached_key_skips_origin() {
        let (_dir, origin, downloader) =
            setup(FakeOrigin::default().with_object("intro.mp4", payload(10)));
        let key = normalize("intro.mp4").unwrap();

        let first = downloader.fetch(&key).await.unwrap();
        let second = downloader.fetch(&key).await.unwrap();
        assert_eq!(first.cache_id, second.cache_id);
        assert_eq!(origin.calls(), 1);
    }
}
