//! Cache Store
//!
//! On-disk table of cached media. One directory per category, one file per
//! entry named by the entry's cache id. Files only ever appear under their
//! final name through `commit`, which renames a fully written staging file
//! into place, so readers never see a partial file.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};

use super::key::{CanonicalKey, MediaCategory};
use super::epoch_millis;

/// Staging area for in-progress downloads, inside the cache root so the
/// final rename never crosses filesystems
const STAGING_DIR: &str = ".staging";

/// Staging files untouched for this long belong to no live download
const STALE_STAGING_AGE: Duration = Duration::from_secs(10 * 60);

/// A cached media file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub cache_id: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub category: MediaCategory,
    pub cached_at: SystemTime,
    /// Updated on every lookup; drives LRU eviction
    pub last_accessed_at: SystemTime,
}

/// JSON view of an entry for the status endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub cache_id: String,
    pub size_bytes: u64,
    pub category: MediaCategory,
    pub cached_at: u64,
    pub last_accessed_at: u64,
}

impl From<&CacheEntry> for EntrySummary {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            cache_id: entry.cache_id.clone(),
            size_bytes: entry.size_bytes,
            category: entry.category,
            cached_at: epoch_millis(entry.cached_at),
            last_accessed_at: epoch_millis(entry.last_accessed_at),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Staged file holds {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Disk-backed cache index
pub struct CacheStore {
    root: PathBuf,
    staging_dir: PathBuf,
    /// Entries by cache id
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Open (or create) a cache rooted at `root`
    ///
    /// Stale staging files from an interrupted run are deleted and the
    /// index is rebuilt from what is on disk.
    ///
    /// # Arguments
    /// * `root` - Cache directory; category and staging subdirectories are created
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::open_existing(root)?;
        store.cleanup();
        Ok(store)
    }

    /// Open a cache that another process may be writing to
    ///
    /// Same as `open` but leaves `.staging` alone, so downloads in progress
    /// in a running server are not disturbed.
    pub fn open_existing(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let staging_dir = root.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir).map_err(io_err(&staging_dir))?;
        for category in MediaCategory::ALL {
            let dir = root.join(category.as_str());
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }

        let store = Self {
            root,
            staging_dir,
            entries: Mutex::new(HashMap::new()),
        };
        store.rebuild_index()?;

        let entries = store.entries.lock();
        info!(
            cache_dir = %store.root.display(),
            entries = entries.len(),
            total_mb = entries.values().map(|e| e.size_bytes).sum::<u64>() / (1024 * 1024),
            "Media cache opened"
        );
        drop(entries);

        Ok(store)
    }

    /// Directory holding one category's files
    pub fn category_dir(&self, category: MediaCategory) -> PathBuf {
        self.root.join(category.as_str())
    }

    fn final_path(&self, key: &CanonicalKey) -> PathBuf {
        self.category_dir(key.category()).join(key.cache_id())
    }

    /// Find a cached entry and mark it as accessed
    pub fn lookup(&self, key: &CanonicalKey) -> Option<CacheEntry> {
        self.find(key, true)
    }

    /// Find a cached entry without touching its access time
    pub fn peek(&self, key: &CanonicalKey) -> Option<CacheEntry> {
        self.find(key, false)
    }

    fn find(&self, key: &CanonicalKey, touch: bool) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        let on_disk = {
            let entry = entries.get(key.cache_id())?;
            // The file may have been removed behind our back
            matches!(fs::metadata(&entry.local_path), Ok(meta) if meta.len() == entry.size_bytes)
        };
        if !on_disk {
            debug!(key = %key, "Cached file missing or resized, dropping entry");
            entries.remove(key.cache_id());
            return None;
        }

        let entry = entries.get_mut(key.cache_id())?;
        if touch {
            entry.last_accessed_at = SystemTime::now();
        }
        Some(entry.clone())
    }

    /// Create an empty staging file for a download
    pub fn stage(&self) -> Result<NamedTempFile, StoreError> {
        tempfile::Builder::new()
            .prefix("dl-")
            .suffix(".tmp")
            .tempfile_in(&self.staging_dir)
            .map_err(io_err(&self.staging_dir))
    }

    /// Move a fully written staging file into the cache
    ///
    /// On any error the staging file is deleted (dropping `staged` removes it).
    ///
    /// # Arguments
    /// * `key` - Normalized key the file is stored under
    /// * `staged` - Staging file from `stage`, fully written
    /// * `size_bytes` - Number of bytes the download produced
    ///
    /// # Returns
    /// The indexed entry, already visible to `lookup`
    pub fn commit(
        &self,
        key: &CanonicalKey,
        staged: TempPath,
        size_bytes: u64,
    ) -> Result<CacheEntry, StoreError> {
        let actual = fs::metadata(&staged).map_err(io_err(&staged))?.len();
        if actual != size_bytes {
            return Err(StoreError::SizeMismatch {
                expected: size_bytes,
                actual,
            });
        }

        let local_path = self.final_path(key);
        staged
            .persist(&local_path)
            .map_err(|e| StoreError::Io {
                path: local_path.clone(),
                source: e.error,
            })?;

        let now = SystemTime::now();
        let entry = CacheEntry {
            cache_id: key.cache_id().to_string(),
            local_path,
            size_bytes,
            category: key.category(),
            cached_at: now,
            last_accessed_at: now,
        };
        self.entries
            .lock()
            .insert(entry.cache_id.clone(), entry.clone());

        debug!(
            key = %key,
            local = %entry.local_path.display(),
            size = size_bytes,
            "Stored file in cache"
        );
        Ok(entry)
    }

    /// Remove the cached copy of `key`; returns whether anything was cached
    pub fn remove(&self, key: &CanonicalKey) -> Result<bool, StoreError> {
        Ok(self.remove_id(key.cache_id())?.is_some())
    }

    /// Remove an entry by cache id, returning it if it existed
    pub fn remove_id(&self, cache_id: &str) -> Result<Option<CacheEntry>, StoreError> {
        let Some(entry) = self.entries.lock().remove(cache_id) else {
            return Ok(None);
        };

        match fs::remove_file(&entry.local_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                // Keep the index truthful: the file is still there
                self.entries
                    .lock()
                    .insert(entry.cache_id.clone(), entry.clone());
                return Err(io_err(&entry.local_path)(e));
            }
        }

        debug!(cache_id = cache_id, size = entry.size_bytes, "Removed cached file");
        Ok(Some(entry))
    }

    /// All entries, optionally restricted to one category
    pub fn list(&self, category: Option<MediaCategory>) -> Vec<CacheEntry> {
        self.entries
            .lock()
            .values()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .cloned()
            .collect()
    }

    /// Remove leftover staging files from interrupted downloads.
    /// Recently written ones may belong to another process and are kept.
    fn cleanup(&self) {
        if let Ok(read_dir) = fs::read_dir(&self.staging_dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                let idle = match entry.metadata().and_then(|meta| meta.modified()) {
                    Ok(modified) => modified.elapsed().unwrap_or(Duration::ZERO),
                    Err(_) => Duration::MAX,
                };
                if idle < STALE_STAGING_AGE {
                    continue;
                }
                debug!(path = %path.display(), "Removing stale staging file");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove staging file");
                }
            }
        }
    }

    /// Index every well-formed cache file already on disk
    fn rebuild_index(&self) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.clear();

        for category in MediaCategory::ALL {
            let dir = self.category_dir(category);
            let read_dir = fs::read_dir(&dir).map_err(io_err(&dir))?;

            for item in read_dir.flatten() {
                let path = item.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !is_cache_id(name) {
                    warn!(path = %path.display(), "Ignoring unexpected file in cache directory");
                    continue;
                }
                let Ok(meta) = item.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }

                let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
                entries.insert(
                    name.to_string(),
                    CacheEntry {
                        cache_id: name.to_string(),
                        local_path: path.clone(),
                        size_bytes: meta.len(),
                        category,
                        cached_at: modified,
                        last_accessed_at: modified,
                    },
                );
            }
        }
        Ok(())
    }
}

fn is_cache_id(name: &str) -> bool {
    name.len() == 40 && name.chars().all(|c| c.is_ascii_hexdigit())
}
