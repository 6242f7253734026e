//! Remote object store seam
//!
//! The cache only needs "stream me the object at this key" and, for bulk
//! warm-up, "list the keys in the bucket". B2 is the production backend.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::b2::OriginError;

/// A recent origin failure, kept for operator dashboards
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub operation: String,
    pub path: String,
    pub error: String,
}

/// Streaming body of a remote object
pub struct ObjectBody {
    /// Length announced by the origin, if any
    pub content_length: Option<u64>,
    /// Object bytes in arrival order
    pub stream: BoxStream<'static, Result<Bytes, OriginError>>,
}

/// Read-only access to the bucket holding the media objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start downloading the object stored under `url_path`, an already
    /// percent-encoded object key.
    async fn get_object(&self, url_path: &str) -> Result<ObjectBody, OriginError>;

    /// List every object key under an optional prefix
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, OriginError>;

    /// Connection health: "healthy", "degraded" or "unhealthy"
    fn health_status(&self) -> &'static str {
        "healthy"
    }

    /// Most recent failures, oldest first
    fn recent_errors(&self) -> Vec<ErrorEntry> {
        Vec::new()
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory origin for tests

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use parking_lot::Mutex;

    use super::{ObjectBody, ObjectStore};
    use crate::b2::OriginError;

    /// How the next downloads should misbehave
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Failure {
        /// Answer normally
        None,
        /// Refuse the connection
        Unreachable,
        /// Send `n` bytes, then break the stream
        MidTransfer(usize),
    }

    pub struct FakeOrigin {
        /// Objects by percent-encoded key
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
        pub fetch_calls: AtomicU64,
        pub delay: Duration,
        /// Failures applied to the next downloads, front first
        pub failures: Mutex<Vec<Failure>>,
    }

    impl Default for FakeOrigin {
        fn default() -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
                fetch_calls: AtomicU64::new(0),
                delay: Duration::ZERO,
                failures: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeOrigin {
        pub fn with_object(self, url_path: &str, bytes: Vec<u8>) -> Self {
            self.objects.lock().insert(url_path.to_string(), bytes);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn fail_next(&self, failure: Failure) {
            self.failures.lock().push(failure);
        }

        pub fn calls(&self) -> u64 {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectStore for FakeOrigin {
        async fn get_object(&self, url_path: &str) -> Result<ObjectBody, OriginError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let failure = {
                let mut failures = self.failures.lock();
                if failures.is_empty() {
                    Failure::None
                } else {
                    failures.remove(0)
                }
            };
            if failure == Failure::Unreachable {
                return Err(OriginError::Network("connection refused".to_string()));
            }

            let bytes = self
                .objects
                .lock()
                .get(url_path)
                .cloned()
                .ok_or_else(|| OriginError::NotFound(url_path.to_string()))?;
            let content_length = Some(bytes.len() as u64);

            let chunks: Vec<Result<Bytes, OriginError>> = match failure {
                Failure::MidTransfer(n) => vec![
                    Ok(Bytes::copy_from_slice(&bytes[..n.min(bytes.len())])),
                    Err(OriginError::Network("connection reset".to_string())),
                ],
                _ => bytes
                    .chunks(4096)
                    .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                    .collect(),
            };

            Ok(ObjectBody {
                content_length,
                stream: futures::stream::iter(chunks).boxed(),
            })
        }

        async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, OriginError> {
            let mut keys: Vec<String> = self
                .objects
                .lock()
                .keys()
                .filter_map(|k| urlencoding::decode(k).ok().map(|k| k.into_owned()))
                .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
                .collect();
            keys.sort();
            Ok(keys)
        }
    }
}
