//! Backblaze B2 API Client
//!
//! Streams media objects out of a B2 bucket. Works against public buckets
//! (no credentials, plain download URL) and private ones (account
//! authorization, token refreshed on 401).

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use futures::{StreamExt, TryStreamExt};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::errors::OriginError;
use super::types::{
    AuthorizeAccountResponse, ListBucketsResponse, ListFileNamesRequest, ListFilesResponse,
};
use crate::config::OriginConfig;
use crate::origin::{ErrorEntry, ObjectBody, ObjectStore};

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Page size for b2_list_file_names
const LIST_PAGE_SIZE: u32 = 1000;

/// First wait after a rate-limited listing page; doubles on each retry
const LIST_BACKOFF: Duration = Duration::from_secs(1);

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// Application key used for private buckets
#[derive(Clone)]
struct Credentials {
    key_id: String,
    key: String,
}

/// Auth state that can be refreshed (interior mutability)
struct AuthState {
    auth_token: Option<String>,
    api_url: Option<String>,
    download_url: String,
    account_id: Option<String>,
    bucket_id: Option<String>,
}

/// B2 client bound to one bucket
#[derive(Clone)]
pub struct B2Client {
    http_client: Client,
    bucket_name: String,
    auth_url: String,
    credentials: Option<Credentials>,
    /// Attempts per listing page when B2 rate limits us
    list_attempts: u32,
    auth_state: Arc<RwLock<AuthState>>,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl B2Client {
    /// Build a client for the configured bucket, authorizing first when
    /// an application key is present.
    pub async fn connect(config: &OriginConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let credentials = match (&config.key_id, &config.key) {
            (Some(key_id), Some(key)) => Some(Credentials {
                key_id: key_id.clone(),
                key: key.clone(),
            }),
            _ => None,
        };

        let client = Self {
            http_client,
            bucket_name: config.bucket_name.clone(),
            auth_url: config.auth_url.clone(),
            credentials,
            list_attempts: config.attempts.max(1),
            auth_state: Arc::new(RwLock::new(AuthState {
                auth_token: None,
                api_url: None,
                download_url: config.download_url.trim_end_matches('/').to_string(),
                account_id: None,
                bucket_id: None,
            })),
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            error_log: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY))),
        };

        if client.credentials.is_some() {
            client
                .refresh_auth()
                .await
                .context("B2 authorization failed")?;
        }

        info!(
            bucket = %client.bucket_name,
            authorized = client.credentials.is_some(),
            "B2 client ready"
        );
        Ok(client)
    }

    /// Re-authorize with B2 and store the fresh token and URLs
    pub async fn refresh_auth(&self) -> Result<(), OriginError> {
        let Some(credentials) = &self.credentials else {
            return Err(OriginError::AuthExpired);
        };
        info!("Authorizing with B2 API...");

        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credentials.key_id, credentials.key));

        let response = self
            .http_client
            .get(&self.auth_url)
            .header("Authorization", format!("Basic {}", encoded))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(match OriginError::from_status(status, &body) {
                OriginError::AuthExpired => OriginError::Forbidden(body),
                other => other,
            });
        }

        let auth: AuthorizeAccountResponse = response.json().await?;

        let mut state = self.auth_state.write();
        state.auth_token = Some(auth.authorization_token);
        state.api_url = Some(auth.api_info.storage_api.api_url);
        state.download_url = auth
            .api_info
            .storage_api
            .download_url
            .trim_end_matches('/')
            .to_string();
        state.account_id = Some(auth.account_id);
        debug!(download_url = %state.download_url, "B2 authorization successful");
        Ok(())
    }

    /// Get connection health status string
    pub fn health(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_state.read().auth_token.clone()
    }

    fn object_url(&self, url_path: &str) -> String {
        format!(
            "{}/file/{}/{}",
            self.auth_state.read().download_url,
            self.bucket_name,
            url_path
        )
    }

    /// Record the outcome of an origin call in the health flag and error log
    fn record(&self, operation: &str, path: &str, result: Result<(), &OriginError>) {
        let err = match result {
            Ok(()) => {
                self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
                return;
            }
            Err(err) => err,
        };

        match err {
            OriginError::Network(_) | OriginError::Timeout => {
                self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed)
            }
            OriginError::RateLimited | OriginError::Server(_, _) => {
                self.health.store(HEALTH_DEGRADED, Ordering::Relaxed)
            }
            // A missing object says nothing about the connection
            _ => {}
        }

        let entry = ErrorEntry {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            operation: operation.to_string(),
            path: path.to_string(),
            error: err.to_string(),
        };

        let mut log = self.error_log.write();
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    async fn send_download(&self, url_path: &str) -> Result<reqwest::Response, OriginError> {
        let url = self.object_url(url_path);
        debug!(url = %url, "Downloading object from B2");

        let mut request = self.http_client.get(&url);
        if let Some(token) = self.auth_token() {
            request = request.header("Authorization", token);
        }
        Ok(request.send().await?)
    }

    async fn download(&self, url_path: &str) -> Result<ObjectBody, OriginError> {
        let mut response = self.send_download(url_path).await?;

        // Tokens expire after 24h; refresh once and try again
        if response.status() == StatusCode::UNAUTHORIZED && self.credentials.is_some() {
            warn!(path = url_path, "Auth expired, refreshing token...");
            self.refresh_auth().await?;
            response = self.send_download(url_path).await?;
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OriginError::from_status(status, &body));
        }

        let content_length = response.content_length();
        let stream = response.bytes_stream().map_err(OriginError::from).boxed();
        Ok(ObjectBody {
            content_length,
            stream,
        })
    }

    /// Look up (once) the bucket ID needed by the listing API
    async fn bucket_id(&self) -> Result<String, OriginError> {
        let (api_url, token, account_id) = {
            let state = self.auth_state.read();
            if let Some(id) = &state.bucket_id {
                return Ok(id.clone());
            }
            match (&state.api_url, &state.auth_token, &state.account_id) {
                (Some(api), Some(token), Some(account)) => {
                    (api.clone(), token.clone(), account.clone())
                }
                _ => {
                    return Err(OriginError::Request(
                        "listing requires B2 credentials".to_string(),
                    ))
                }
            }
        };

        let response = self
            .http_client
            .post(format!("{}/b2api/v2/b2_list_buckets", api_url))
            .header("Authorization", token)
            .json(&serde_json::json!({
                "accountId": account_id,
                "bucketName": self.bucket_name
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OriginError::from_status(status, &body));
        }

        let list: ListBucketsResponse = response.json().await?;
        let bucket_id = list
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == self.bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| OriginError::NotFound(format!("bucket '{}'", self.bucket_name)))?;

        self.auth_state.write().bucket_id = Some(bucket_id.clone());
        Ok(bucket_id)
    }

    async fn list_file_names(&self, prefix: Option<&str>) -> Result<Vec<String>, OriginError> {
        let bucket_id = self.bucket_id().await?;
        let mut keys = Vec::new();
        let mut start_file_name: Option<String> = None;
        // Both reset after every page that succeeds
        let mut refreshed = false;
        let mut rate_limited: u32 = 0;

        loop {
            let (api_url, token) = {
                let state = self.auth_state.read();
                (state.api_url.clone(), state.auth_token.clone())
            };
            let (Some(api_url), Some(token)) = (api_url, token) else {
                return Err(OriginError::AuthExpired);
            };

            let request = ListFileNamesRequest {
                bucket_id: bucket_id.clone(),
                prefix: prefix.map(String::from),
                max_file_count: LIST_PAGE_SIZE,
                start_file_name: start_file_name.clone(),
            };
            debug!(prefix = ?prefix, start = ?start_file_name, "Listing files from B2");

            let response = self
                .http_client
                .post(format!("{}/b2api/v2/b2_list_file_names", api_url))
                .header("Authorization", token)
                .json(&request)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                if status == 429 {
                    rate_limited += 1;
                    if rate_limited >= self.list_attempts {
                        return Err(OriginError::RateLimited);
                    }
                    let delay = LIST_BACKOFF * 2u32.saturating_pow(rate_limited - 1);
                    warn!(
                        attempt = rate_limited,
                        max = self.list_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "B2 rate limit hit, backing off..."
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                if status == 401 {
                    // A key without listFiles keeps getting 401 with a fresh token
                    if refreshed {
                        return Err(OriginError::Forbidden(body));
                    }
                    warn!("Auth expired while listing, refreshing token...");
                    self.refresh_auth().await?;
                    refreshed = true;
                    continue;
                }
                return Err(OriginError::from_status(status, &body));
            }
            refreshed = false;
            rate_limited = 0;

            let page: ListFilesResponse = response.json().await?;
            keys.extend(
                page.files
                    .into_iter()
                    .filter(|f| f.is_object())
                    .map(|f| f.file_name),
            );

            match page.next_file_name {
                Some(next) => start_file_name = Some(next),
                None => break,
            }
        }

        debug!(count = keys.len(), "Listed files from B2");
        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for B2Client {
    async fn get_object(&self, url_path: &str) -> Result<ObjectBody, OriginError> {
        let result = self.download(url_path).await;
        self.record("download", url_path, result.as_ref().map(|_| ()));
        result
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, OriginError> {
        let result = self.list_file_names(prefix).await;
        self.record("list", prefix.unwrap_or(""), result.as_ref().map(|_| ()));
        result
    }

    fn health_status(&self) -> &'static str {
        self.health()
    }

    fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log.read().iter().cloned().collect()
    }
}
