//! Key Normalizer
//!
//! Maps the filename the application stores (gallery metadata, CMS fields)
//! to the object key that actually exists in the bucket, and to the stable
//! identifier used for the on-disk copy. Pure: no I/O, no global state.
//!
//! Normalization is idempotent: feeding a canonical key back in yields the
//! same key. Percent-decoding runs to a fixed point, so a name that was
//! encoded twice by some client collapses to the same key as the plain one.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Names carrying this prefix were uploaded with spaces where the
/// application stores underscores.
static HISTORICAL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^gallery_").expect("valid regex"));

/// `%25` directly wrapping another escape, i.e. an escape that was encoded again
static DOUBLE_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%25([0-9A-Fa-f]{2})").expect("valid regex"));

/// Encoding layers we are willing to peel before calling the name malformed
const MAX_DECODE_PASSES: usize = 4;

/// Media category, which also selects the cache subdirectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Video,
    Image,
}

impl MediaCategory {
    pub const ALL: [MediaCategory; 2] = [MediaCategory::Video, MediaCategory::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Video => "video",
            MediaCategory::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" | "videos" => Some(MediaCategory::Video),
            "image" | "images" => Some(MediaCategory::Image),
            _ => None,
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected logical filename
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
}

fn invalid(reason: impl Into<String>) -> KeyError {
    KeyError::InvalidFilename(reason.into())
}

/// The exact object key expected in remote storage
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    key: String,
    cache_id: String,
    category: MediaCategory,
    content_type: &'static str,
}

impl CanonicalKey {
    /// Object key as stored in the bucket (decoded)
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Key encoded once, segment by segment, for the outbound request URL
    pub fn url_path(&self) -> String {
        self.key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Hex SHA-1 of the key; the on-disk file name
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    pub fn category(&self) -> MediaCategory {
        self.category
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Normalize a logical filename into its canonical object key
pub fn normalize(logical: &str) -> Result<CanonicalKey, KeyError> {
    let decoded = decode_fully(logical)?;

    let mut segments = Vec::new();
    for raw in decoded.split('/') {
        let segment = raw.trim();
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(invalid("path traversal is not allowed"));
        }
        if segment.contains('\\') || segment.chars().any(char::is_control) {
            return Err(invalid("forbidden character in filename"));
        }
        segments.push(segment.to_string());
    }

    let Some(base) = segments.pop() else {
        return Err(invalid("empty filename"));
    };
    let base = apply_naming_convention(&base);
    let base = base.trim();
    if base.is_empty() {
        return Err(invalid("empty filename"));
    }
    segments.push(base.to_string());

    let key = segments.join("/");
    let (category, content_type) = classify(&key)
        .ok_or_else(|| invalid(format!("unsupported media type: {}", key)))?;

    Ok(CanonicalKey {
        cache_id: hash_key(&key),
        key,
        category,
        content_type,
    })
}

/// Peel percent-encoding layers until the name stops changing.
///
/// `%25XX` sequences are collapsed to `%XX` before each decode, so one
/// pass removes every redundant layer wrapped around an escape.
fn decode_fully(input: &str) -> Result<String, KeyError> {
    let mut current = input.to_string();
    for _ in 0..MAX_DECODE_PASSES {
        let collapsed = collapse_double_escapes(&current);
        let decoded = urlencoding::decode(&collapsed)
            .map_err(|_| invalid("filename is not valid UTF-8 once decoded"))?
            .into_owned();
        if decoded == current {
            return Ok(current);
        }
        current = decoded;
    }
    Err(invalid("filename is encoded too many times"))
}

fn collapse_double_escapes(input: &str) -> String {
    let mut current = input.to_string();
    while DOUBLE_ESCAPE.is_match(&current) {
        current = DOUBLE_ESCAPE.replace_all(&current, "%$1").into_owned();
    }
    current
}

/// Historical gallery uploads use spaces where the CMS stored underscores.
/// After the substitution the prefix no longer matches, so it never reapplies.
fn apply_naming_convention(base: &str) -> String {
    if HISTORICAL_PREFIX.is_match(base) {
        base.replace('_', " ")
    } else {
        base.to_string()
    }
}

fn classify(key: &str) -> Option<(MediaCategory, &'static str)> {
    let (_, ext) = key.rsplit_once('.')?;
    let found = match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => (MediaCategory::Video, "video/mp4"),
        "webm" => (MediaCategory::Video, "video/webm"),
        "mov" => (MediaCategory::Video, "video/quicktime"),
        "ogv" => (MediaCategory::Video, "video/ogg"),
        "mkv" => (MediaCategory::Video, "video/x-matroska"),
        "jpg" | "jpeg" => (MediaCategory::Image, "image/jpeg"),
        "png" => (MediaCategory::Image, "image/png"),
        "gif" => (MediaCategory::Image, "image/gif"),
        "webp" => (MediaCategory::Image, "image/webp"),
        "avif" => (MediaCategory::Image, "image/avif"),
        "svg" => (MediaCategory::Image, "image/svg+xml"),
        _ => return None,
    };
    Some(found)
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_name_is_unchanged() {
        let key = normalize("hero-banner.webp").unwrap();
        assert_eq!(key.as_str(), "hero-banner.webp");
        assert_eq!(key.category(), MediaCategory::Image);
        assert_eq!(key.content_type(), "image/webp");
        assert_eq!(key.url_path(), "hero-banner.webp");
    }

    #[test]
    fn test_gallery_prefix_uses_spaces() {
        let key = normalize("gallery_summer_walk (1).mp4").unwrap();
        assert_eq!(key.as_str(), "gallery summer walk (1).mp4");
        assert_eq!(key.url_path(), "gallery%20summer%20walk%20%281%29.mp4");
        assert_eq!(key.category(), MediaCategory::Video);
    }

    #[test]
    fn test_underscores_elsewhere_are_kept() {
        let key = normalize("team_photo_2019.jpg").unwrap();
        assert_eq!(key.as_str(), "team_photo_2019.jpg");
    }

    #[test]
    fn test_encoded_and_plain_names_share_a_key() {
        let plain = normalize("gallery summer walk.mp4").unwrap();
        let once = normalize("gallery%20summer%20walk.mp4").unwrap();
        let twice = normalize("gallery%2520summer%2520walk.mp4").unwrap();
        let thrice = normalize("gallery%252520summer%252520walk.mp4").unwrap();
        let underscored = normalize("gallery_summer_walk.mp4").unwrap();
        assert_eq!(plain, once);
        assert_eq!(plain, twice);
        assert_eq!(plain, thrice);
        assert_eq!(plain, underscored);
        assert_eq!(plain.cache_id(), underscored.cache_id());
    }

    #[test]
    fn test_literal_percent_survives() {
        let key = normalize("50%off.png").unwrap();
        assert_eq!(key.as_str(), "50%off.png");
        assert_eq!(key.url_path(), "50%25off.png");
        assert_eq!(normalize(key.as_str()).unwrap(), key);
    }

    #[test]
    fn test_slashes_are_collapsed() {
        let key = normalize("/videos//intro.mp4/").unwrap();
        assert_eq!(key.as_str(), "videos/intro.mp4");
        assert_eq!(key.url_path(), "videos/intro.mp4");
    }

    #[test]
    fn test_traversal_is_rejected() {
        for name in ["../secret.mp4", "videos/../../etc/x.png", "%2e%2e/x.mp4", "%252e%252e%252fx.mp4"] {
            assert!(
                matches!(normalize(name), Err(KeyError::InvalidFilename(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_empty_and_unsupported_are_rejected() {
        assert!(normalize("").is_err());
        assert!(normalize("   ").is_err());
        assert!(normalize("///").is_err());
        assert!(normalize("notes.txt").is_err());
        assert!(normalize("no-extension").is_err());
        assert!(normalize("bad\u{0}name.mp4").is_err());
        assert!(normalize("dir\\clip.mp4").is_err());
    }

    #[test]
    fn test_cache_id_is_hex_sha1() {
        let key = normalize("intro.mp4").unwrap();
        assert_eq!(key.cache_id().len(), 40);
        assert!(key.cache_id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key.cache_id(), normalize("intro.webm").unwrap().cache_id());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(MediaCategory::parse("Video"), Some(MediaCategory::Video));
        assert_eq!(MediaCategory::parse("images"), Some(MediaCategory::Image));
        assert_eq!(MediaCategory::parse("audio"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        #[test]
        fn test_normalize_is_idempotent(
            stem in "(gallery_|Gallery_|%25|%2520|%20|%|_| |/|[a-z0-9()]){1,24}",
            ext in "(mp4|webm|JPG|png|txt)"
        ) {
            let name = format!("{}.{}", stem, ext);
            if let Ok(once) = normalize(&name) {
                let twice = normalize(once.as_str()).unwrap();
                prop_assert_eq!(&twice, &once);
                prop_assert_eq!(twice.cache_id(), once.cache_id());
            }
        }

        #[test]
        fn test_encoded_form_normalizes_to_same_key(stem in "[a-z0-9 ()_]{1,24}") {
            let name = format!("{}.mp4", stem);
            if let Ok(plain) = normalize(&name) {
                let encoded = normalize(&plain.url_path()).unwrap();
                prop_assert_eq!(encoded, plain);
            }
        }
    }
}
