//! HTTP server
//!
//! Binds the listener, builds the router and runs until the shutdown
//! future resolves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tracing::info;

use super::errors::ApiError;
use super::media::serve_media;
use super::protocol::{parse_body, ClearRequest, ForceRequest, ForceTarget, StatusRequest};
use crate::cache::status::FileStatus;
use crate::cache::{ClearReport, MediaCache, StatsReport, WarmReport};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Routes of the media service
pub fn router(cache: Arc<MediaCache>) -> Router {
    Router::new()
        .route("/media", get(serve_media))
        .route("/cache/status", post(cache_status))
        .route("/cache/force", post(cache_force))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/stats", get(cache_stats))
        .with_state(cache)
}

pub struct MediaServer {
    cache: Arc<MediaCache>,
    listener: Option<TcpListener>,
}

impl MediaServer {
    pub fn new(cache: Arc<MediaCache>) -> Self {
        Self {
            cache,
            listener: None,
        }
    }

    /// Bind the listening socket
    pub async fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local = listener.local_addr().context("Failed to read bound address")?;
        info!(addr = %local, "HTTP server listening");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Serve requests until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.listener.context("Server not started")?;
        axum::serve(listener, router(self.cache))
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server error")?;
        info!("HTTP server stopped");
        Ok(())
    }
}

fn body<T: DeserializeOwned + Default>(data: &[u8]) -> Result<T, ApiError> {
    parse_body(data).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

async fn cache_status(
    State(cache): State<Arc<MediaCache>>,
    data: Bytes,
) -> ApiResult<std::collections::BTreeMap<String, FileStatus>> {
    let request: StatusRequest = body(&data)?;
    Ok(Json(cache.status_for(&request.into_filenames())))
}

async fn cache_force(State(cache): State<Arc<MediaCache>>, data: Bytes) -> ApiResult<WarmReport> {
    let request: ForceRequest = body(&data)?;
    let report = match request.target().map_err(ApiError::BadRequest)? {
        ForceTarget::Files(filenames) => cache.force_cache(filenames).await,
        ForceTarget::All => cache.force_cache_all().await?,
    };
    Ok(Json(report))
}

async fn cache_clear(State(cache): State<Arc<MediaCache>>, data: Bytes) -> ApiResult<ClearReport> {
    let request: ClearRequest = body(&data)?;
    let category = request.category().map_err(ApiError::BadRequest)?;
    Ok(Json(cache.clear(category)))
}

async fn cache_stats(State(cache): State<Arc<MediaCache>>) -> Json<StatsReport> {
    Json(cache.full_stats())
}
