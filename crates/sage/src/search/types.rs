//! Provider-independent search types
//!
//! Every provider adapter translates its own JSON into these shapes at the
//! boundary. Entries without a usable http(s) URL are dropped there, so nothing
//! ambiguous travels further into the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::retry::{Classify, FailureClass};

/// One web hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
}

impl SearchResult {
    /// Validated constructor; `None` when the URL is unusable
    pub fn new(title: &str, url: &str, content: &str) -> Option<Self> {
        let url = normalize_url(url)?;
        let title = title.trim();
        Some(Self {
            title: if title.is_empty() {
                url.clone()
            } else {
                title.to_string()
            },
            url,
            content: content.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ImageResult {
    pub url: String,
    pub alt: String,
    pub source_url: String,
}

impl ImageResult {
    /// `source_url` falls back to the image URL when the page is unknown
    pub fn new(url: &str, alt: &str, source_url: Option<&str>) -> Option<Self> {
        let url = normalize_url(url)?;
        let source_url = source_url
            .and_then(normalize_url)
            .unwrap_or_else(|| url.clone());
        Some(Self {
            url,
            alt: alt.trim().to_string(),
            source_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct VideoResult {
    pub title: String,
    pub url: String,
    pub thumbnail: Option<String>,
    pub duration: Option<String>,
}

impl VideoResult {
    pub fn new(
        title: &str,
        url: &str,
        thumbnail: Option<&str>,
        duration: Option<&str>,
    ) -> Option<Self> {
        let url = normalize_url(url)?;
        Some(Self {
            title: title.trim().to_string(),
            url,
            thumbnail: thumbnail.and_then(normalize_url),
            duration: duration
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from),
        })
    }
}

/// An auxiliary sub-investigation run alongside the main query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct Perspective {
    pub id: String,
    pub title: String,
    pub description: String,
    pub results: Vec<SearchResult>,
}

/// What a provider returns for one query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub images: Vec<ImageResult>,
    pub videos: Vec<VideoResult>,
}

impl SearchResponse {
    pub fn has_results(&self) -> bool {
        !self.results.is_empty()
    }
}

/// Error type for search provider operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("Request timed out")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Unknown provider error: {0}")]
    Unknown(String),
}

impl Classify for SearchError {
    fn classify(&self) -> FailureClass {
        match self {
            SearchError::Timeout | SearchError::Network(_) | SearchError::Unknown(_) => {
                FailureClass::Retryable
            }
            SearchError::Server { status, .. } if *status >= 500 => FailureClass::Retryable,
            SearchError::RateLimited { retry_after_ms } => FailureClass::RateLimited {
                retry_after: retry_after_ms.map(Duration::from_millis),
            },
            SearchError::AuthError(_) | SearchError::Parse(_) | SearchError::Server { .. } => {
                FailureClass::Fatal
            }
        }
    }
}

/// A web-search backend
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Stable name, also used as the health-tracking key
    fn name(&self) -> &str;

    /// Whether credentials are present
    fn is_configured(&self) -> bool {
        true
    }

    async fn query(&self, text: &str) -> Result<SearchResponse, SearchError>;
}

/// Trimmed http(s) URL with a non-empty host part, or `None`
pub(crate) fn normalize_url(raw: &str) -> Option<String> {
    let url = raw.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || url.chars().any(char::is_whitespace) {
        return None;
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert_eq!(normalize_url(" https://x ").as_deref(), Some("https://x"));
        assert!(normalize_url("http://example.com/a?b=1").is_some());
        assert!(normalize_url("ftp://example.com").is_none());
        assert!(normalize_url("https://").is_none());
        assert!(normalize_url("https:///path").is_none());
        assert!(normalize_url("https://exa mple.com").is_none());
        assert!(normalize_url("").is_none());
    }

    #[test]
    fn test_search_result_rejects_malformed_entries() {
        assert!(SearchResult::new("Title", "not a url", "body").is_none());

        let result = SearchResult::new("  ", "https://x", " body ").unwrap();
        assert_eq!(result.title, "https://x");
        assert_eq!(result.content, "body");
    }

    #[test]
    fn test_image_source_defaults_to_image_url() {
        let image = ImageResult::new("https://img/1.png", "alt", None).unwrap();
        assert_eq!(image.source_url, "https://img/1.png");

        let image = ImageResult::new("https://img/1.png", "", Some("https://page")).unwrap();
        assert_eq!(image.source_url, "https://page");
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(SearchError::Timeout.classify(), FailureClass::Retryable);
        assert_eq!(
            SearchError::Server {
                status: 503,
                message: String::new()
            }
            .classify(),
            FailureClass::Retryable
        );
        assert_eq!(
            SearchError::Server {
                status: 400,
                message: String::new()
            }
            .classify(),
            FailureClass::Fatal
        );
        assert_eq!(
            SearchError::AuthError("bad key".into()).classify(),
            FailureClass::Fatal
        );
        assert_eq!(
            SearchError::RateLimited {
                retry_after_ms: Some(1500)
            }
            .classify(),
            FailureClass::RateLimited {
                retry_after: Some(Duration::from_millis(1500))
            }
        );
    }
}
