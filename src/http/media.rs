//! Range-Proxy Handler
//!
//! `GET /media?filename=...`: normalize, resolve through the cache (waiting
//! for a download when needed), then serve the whole file or the requested
//! byte window straight from the local copy.

use std::io::{self, SeekFrom};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::errors::ApiError;
use super::protocol::MediaQuery;
use super::range::{parse_range, ByteRange};
use crate::cache::{normalize, CacheEntry, CanonicalKey, KeyError, MediaCache};

pub async fn serve_media(
    State(cache): State<Arc<MediaCache>>,
    method: Method,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    cache.counters().record_request();
    let result = serve(&cache, &method, query, &headers).await;
    if result.is_err() {
        cache.counters().record_error();
    }
    result
}

async fn serve(
    cache: &MediaCache,
    method: &Method,
    query: MediaQuery,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let filename = query
        .filename
        .ok_or_else(|| KeyError::InvalidFilename("missing filename parameter".to_string()))?;
    let key = normalize(&filename)?;

    let entry = cache.resolve(&key).await?;
    let (entry, file) = open_entry(cache, &key, entry).await?;
    let size = entry.size_bytes;

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(raw) => parse_range(raw, size).map_err(|source| ApiError::Range { source, size })?,
        None => None,
    };

    let (status, window) = match range {
        Some(range) => {
            cache.counters().record_partial();
            (StatusCode::PARTIAL_CONTENT, range)
        }
        None if size == 0 => return Ok(empty_file(&key, method)),
        None => (StatusCode::OK, ByteRange { start: 0, end: size - 1 }),
    };

    debug!(
        key = %key,
        status = status.as_u16(),
        start = window.start,
        end = window.end,
        size = size,
        "Serving media"
    );

    let mut response_headers: Vec<(HeaderName, String)> = vec![
        (header::CONTENT_TYPE, key.content_type().to_string()),
        (header::CONTENT_LENGTH, window.len().to_string()),
        (header::ACCEPT_RANGES, "bytes".to_string()),
    ];
    if status == StatusCode::PARTIAL_CONTENT {
        response_headers.push((header::CONTENT_RANGE, window.content_range(size)));
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        open_window(file, window).await?
    };

    let mut response = (status, body).into_response();
    for (name, value) in response_headers {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

/// Open the cached file behind `entry`. If a concurrent clear or eviction
/// removed it after `resolve`, resolve once more and open the fresh copy.
async fn open_entry(
    cache: &MediaCache,
    key: &CanonicalKey,
    entry: CacheEntry,
) -> Result<(CacheEntry, File), ApiError> {
    match File::open(&entry.local_path).await {
        Ok(file) => Ok((entry, file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(key = %key, "Cached file removed before it was opened, resolving again");
            let entry = cache.resolve(key).await?;
            let file = File::open(&entry.local_path).await?;
            Ok((entry, file))
        }
        Err(e) => Err(e.into()),
    }
}

/// Stream exactly `window` out of the cached file
async fn open_window(mut file: File, window: ByteRange) -> Result<Body, ApiError> {
    if window.start > 0 {
        file.seek(SeekFrom::Start(window.start)).await?;
    }
    Ok(Body::from_stream(ReaderStream::new(file.take(window.len()))))
}

fn empty_file(key: &CanonicalKey, method: &Method) -> Response {
    debug!(key = %key, method = %method, "Serving empty media file");
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, key.content_type()),
            (header::CONTENT_LENGTH, "0"),
            (header::ACCEPT_RANGES, "bytes"),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{cache_with, payload};
    use crate::origin::fake::FakeOrigin;

    #[tokio::test]
    async fn test_file_removed_after_resolve_is_fetched_again() {
        let source = payload(2_000);
        let (_dir, origin, cache) =
            cache_with(FakeOrigin::default().with_object("intro.mp4", source.clone()));
        let key = normalize("intro.mp4").unwrap();

        let entry = cache.resolve(&key).await.unwrap();
        cache.clear(None);
        assert!(!entry.local_path.exists());

        let (fresh, mut file) = open_entry(&cache, &key, entry).await.unwrap();
        assert_eq!(fresh.size_bytes, 2_000);
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, source);
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_window_streams_requested_bytes() {
        let source = payload(1_000);
        let (_dir, _origin, cache) =
            cache_with(FakeOrigin::default().with_object("hero.png", source.clone()));
        let key = normalize("hero.png").unwrap();
        let entry = cache.resolve(&key).await.unwrap();
        let (_, file) = open_entry(&cache, &key, entry).await.unwrap();

        let body = open_window(file, ByteRange { start: 100, end: 199 }).await.unwrap();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), &source[100..200]);
    }
}
