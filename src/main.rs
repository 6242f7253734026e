//! MediaCache Daemon - caching range proxy for B2-hosted media
//!
//! Serves video and image objects from a Backblaze B2 bucket as local,
//! seekable files: the first request downloads the object once, every later
//! request (including byte ranges) is answered from disk.

mod b2;
mod cache;
mod config;
mod http;
mod origin;

use anyhow::{anyhow, Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use b2::B2Client;
use cache::{CacheSettings, CacheStore, CapacityManager, MediaCache, MediaCategory};
use config::Config;
use http::MediaServer;

/// CLI command
#[derive(Debug, PartialEq, Eq)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Download the given files into the cache and exit
    Warm { filenames: Vec<String> },
    /// Print cache usage
    Stats,
    /// Delete cached files, optionally of one category
    Clear { category: Option<MediaCategory> },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"MediaCache Daemon - Serve B2-hosted media as local, seekable files

USAGE:
    mediacache-daemon                        # Run HTTP server (default)
    mediacache-daemon serve
    mediacache-daemon warm <filename>...
    mediacache-daemon stats
    mediacache-daemon clear [video|image]
    mediacache-daemon help

COMMANDS:
    serve   Run the media proxy and cache administration API
    warm    Download the given files into the cache, then exit
    stats   Print cache usage by category
    clear   Delete cached files (all, or one category)
    help    Show this help message

ENVIRONMENT:
    B2_BUCKET                 Bucket holding the media (required)
    B2_KEY_ID                 B2 application key ID (private buckets)
    B2_KEY                    B2 application key (private buckets)
    B2_DOWNLOAD_URL           Download host for public buckets
    B2_AUTH_URL               Account authorization endpoint
    MEDIA_LISTEN_ADDR         HTTP bind address (default 0.0.0.0:8080)
    MEDIA_CACHE_DIR           Cache root directory
    MEDIA_CACHE_MAX_BYTES     Capacity ceiling in bytes (default 10 GiB)
    MEDIA_AUTO_EVICT          Evict least recently used files past the ceiling (default false)
    MEDIA_FETCH_TIMEOUT_SECS  Connect/read timeout per origin attempt (default 10)
    MEDIA_FETCH_ATTEMPTS      Origin attempts for transient failures (default 2)
    MEDIA_NOT_FOUND_TTL_SECS  How long an origin 404 is remembered (default 30)
    MEDIA_WARM_CONCURRENCY    Parallel downloads while warming (default 4)
    RUST_LOG                  Log level or filter (trace, debug, info, warn, error)

NOTE:
    stats and clear work on the cache directory directly and do not contact
    the bucket. They leave in-progress downloads alone, and a running server
    notices cleared files on the next request.
"#
    );
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.get(1) else {
        return Ok(Command::Serve);
    };

    match command.as_str() {
        "serve" => Ok(Command::Serve),
        "warm" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: mediacache-daemon warm <filename>..."));
            }
            Ok(Command::Warm {
                filenames: args[2..].to_vec(),
            })
        }
        "stats" => Ok(Command::Stats),
        "clear" => {
            let category = match args.get(2) {
                None => None,
                Some(raw) if raw == "all" => None,
                Some(raw) => Some(
                    MediaCategory::parse(raw)
                        .ok_or_else(|| anyhow!("Unknown category: {} (expected video or image)", raw))?,
                ),
            };
            Ok(Command::Clear { category })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", command);
            Ok(Command::Help)
        }
    }
}

async fn open_cache(config: &Config) -> Result<Arc<MediaCache>> {
    let client = B2Client::connect(&config.origin)
        .await
        .context("Failed to set up B2 client")?;
    let cache = MediaCache::open(CacheSettings::from_config(config), Arc::new(client))
        .with_context(|| format!("Failed to open cache at {}", config.cache_root.display()))?;
    Ok(Arc::new(cache))
}

fn open_capacity(config: &Config) -> Result<CapacityManager> {
    let store = CacheStore::open_existing(&config.cache_root)
        .with_context(|| format!("Failed to open cache at {}", config.cache_root.display()))?;
    Ok(CapacityManager::new(Arc::new(store), config.max_cache_bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = env::args().collect();
    let command = match parse_args(&args) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };

    match command {
        Command::Serve => {
            info!(
                bucket = %config.origin.bucket_name,
                cache_dir = %config.cache_root.display(),
                max_mb = config.max_cache_bytes / (1024 * 1024),
                "Starting media cache daemon"
            );

            let cache = open_cache(&config).await?;
            let mut server = MediaServer::new(cache);
            if let Err(e) = server.start(config.listen_addr).await {
                error!(error = %e, "Failed to start HTTP server");
                return Err(e);
            }

            server
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(error = %e, "Failed to listen for shutdown signal");
                    }
                    info!("Received shutdown signal, finishing open requests...");
                })
                .await?;

            info!("Shutdown complete.");
        }
        Command::Warm { filenames } => {
            let cache = open_cache(&config).await?;
            let report = cache.force_cache(filenames).await;

            println!("Cached: {}", report.cached_count);
            for failure in &report.failures {
                println!("  FAILED {}: {}", failure.filename, failure.error);
            }
            if !report.failures.is_empty() {
                std::process::exit(2);
            }
        }
        Command::Stats => {
            let stats = open_capacity(&config)?.stats();
            println!("Cache directory: {}", config.cache_root.display());
            println!(
                "  video: {} files, {} bytes",
                stats.video.count, stats.video.size_bytes
            );
            println!(
                "  image: {} files, {} bytes",
                stats.image.count, stats.image.size_bytes
            );
            println!(
                "  total: {} files, {} of {} bytes ({:.2}%)",
                stats.total.count, stats.total.size_bytes, stats.limit_bytes, stats.usage_percent
            );
        }
        Command::Clear { category } => {
            let report = open_capacity(&config)?.clear(category);
            println!(
                "Removed {} files ({} bytes)",
                report.removed_count, report.removed_bytes
            );
        }
        Command::Help => print_help(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("mediacache-daemon")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_default_is_serve() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Command::Serve);
        assert_eq!(parse_args(&args(&["serve"])).unwrap(), Command::Serve);
    }

    #[test]
    fn test_warm_takes_filenames() {
        assert_eq!(
            parse_args(&args(&["warm", "a.mp4", "gallery_b.jpg"])).unwrap(),
            Command::Warm {
                filenames: vec!["a.mp4".to_string(), "gallery_b.jpg".to_string()]
            }
        );
        assert!(parse_args(&args(&["warm"])).is_err());
    }

    #[test]
    fn test_clear_category() {
        assert_eq!(
            parse_args(&args(&["clear"])).unwrap(),
            Command::Clear { category: None }
        );
        assert_eq!(
            parse_args(&args(&["clear", "video"])).unwrap(),
            Command::Clear {
                category: Some(MediaCategory::Video)
            }
        );
        assert!(parse_args(&args(&["clear", "audio"])).is_err());
    }

    #[test]
    fn test_unknown_command_shows_help() {
        assert_eq!(parse_args(&args(&["mount"])).unwrap(), Command::Help);
    }
}
