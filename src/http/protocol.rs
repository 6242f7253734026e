//! JSON bodies of the HTTP API
//!
//! Requests are camelCase; responses reuse the serializable report types of
//! the cache module.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::MediaCategory;

/// Query string of `GET /media`
#[derive(Debug, Clone, Deserialize)]
pub struct MediaQuery {
    pub filename: Option<String>,
}

/// Body of `POST /cache/status`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    #[serde(default)]
    pub filenames: Vec<String>,
    /// Single-name shorthand
    pub filename: Option<String>,
}

impl StatusRequest {
    pub fn into_filenames(self) -> Vec<String> {
        let mut filenames = self.filenames;
        filenames.extend(self.filename);
        filenames
    }
}

/// Body of `POST /cache/force`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceRequest {
    pub filename: Option<String>,
    pub filenames: Option<Vec<String>>,
    #[serde(default)]
    pub all: bool,
}

/// What a force request asks to warm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceTarget {
    Files(Vec<String>),
    All,
}

impl ForceRequest {
    pub fn target(self) -> Result<ForceTarget, String> {
        if self.all {
            return Ok(ForceTarget::All);
        }
        let mut filenames = self.filenames.unwrap_or_default();
        filenames.extend(self.filename);
        if filenames.is_empty() {
            return Err("expected `filename`, `filenames` or `all: true`".to_string());
        }
        Ok(ForceTarget::Files(filenames))
    }
}

/// Body of `POST /cache/clear`; empty means everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClearRequest {
    pub category: Option<String>,
}

impl ClearRequest {
    pub fn category(&self) -> Result<Option<MediaCategory>, String> {
        match self.category.as_deref().map(str::trim) {
            None | Some("") | Some("all") => Ok(None),
            Some(raw) => MediaCategory::parse(raw)
                .map(Some)
                .ok_or_else(|| format!("unknown category: {}", raw)),
        }
    }
}

/// Error body for every non-media failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Parse a JSON body; an empty body yields the default value
pub fn parse_body<T>(data: &[u8]) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned + Default,
{
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(data)
}
