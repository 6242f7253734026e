//! Process configuration
//!
//! Everything is read from the environment once at startup.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// B2 v3 account authorization endpoint
const B2_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// Download host used for public buckets when none is configured
const B2_DEFAULT_DOWNLOAD_URL: &str = "https://f000.backblazeb2.com";

/// Default capacity ceiling: 10 GB
const DEFAULT_MAX_CACHE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Remote storage settings
#[derive(Debug, Clone)]
pub struct OriginConfig {
    pub bucket_name: String,
    pub download_url: String,
    pub auth_url: String,
    pub key_id: Option<String>,
    pub key: Option<String>,
    /// Connect and read timeout for each attempt
    pub timeout: Duration,
    /// Attempts for a rate-limited listing page
    pub attempts: u32,
}

/// Full daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub cache_root: PathBuf,
    pub max_cache_bytes: u64,
    pub auto_evict: bool,
    /// Total origin attempts for transient failures
    pub fetch_attempts: u32,
    /// How long an origin 404 is remembered; zero disables
    pub not_found_ttl: Duration,
    pub warm_concurrency: usize,
    pub origin: OriginConfig,
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bucket_name = get("B2_BUCKET").ok_or_else(|| anyhow!("B2_BUCKET must be set"))?;

        let cache_root = match get("MEDIA_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("mediacache"),
        };

        let timeout_secs: u64 = parse_var(&get, "MEDIA_FETCH_TIMEOUT_SECS", 10)?;
        let fetch_attempts: u32 = parse_var(&get, "MEDIA_FETCH_ATTEMPTS", 2)?;
        if fetch_attempts == 0 {
            return Err(anyhow!("MEDIA_FETCH_ATTEMPTS must be at least 1"));
        }

        Ok(Self {
            listen_addr: parse_var(&get, "MEDIA_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            cache_root,
            max_cache_bytes: parse_var(&get, "MEDIA_CACHE_MAX_BYTES", DEFAULT_MAX_CACHE_SIZE)?,
            auto_evict: parse_var(&get, "MEDIA_AUTO_EVICT", false)?,
            fetch_attempts,
            not_found_ttl: Duration::from_secs(parse_var(&get, "MEDIA_NOT_FOUND_TTL_SECS", 30)?),
            warm_concurrency: parse_var::<usize, _>(&get, "MEDIA_WARM_CONCURRENCY", 4)?.max(1),
            origin: OriginConfig {
                bucket_name,
                download_url: get("B2_DOWNLOAD_URL")
                    .unwrap_or_else(|| B2_DEFAULT_DOWNLOAD_URL.to_string()),
                auth_url: get("B2_AUTH_URL").unwrap_or_else(|| B2_AUTH_URL.to_string()),
                key_id: get("B2_KEY_ID"),
                key: get("B2_KEY"),
                timeout: Duration::from_secs(timeout_secs),
                attempts: fetch_attempts,
            },
        })
    }
}

fn parse_var<T, F>(get: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}
