use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{api_key_from_env, read_json, request_error, str_field};
use crate::search::{SearchError, SearchProvider, SearchResponse, SearchResult, VideoResult};

const ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// Brave web search API; also the source of video results
pub struct BraveSearch {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    max_results: usize,
}

impl BraveSearch {
    pub fn new(api_key: Option<String>, max_results: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: ENDPOINT.to_string(),
            max_results,
        }
    }

    /// Reads `BRAVE_API_KEY`
    pub fn from_env(max_results: usize) -> Self {
        Self::new(api_key_from_env("BRAVE_API_KEY"), max_results)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Brave omits the `web` section entirely when nothing matched
    pub(crate) fn parse_response(json: &Value) -> Result<SearchResponse, SearchError> {
        if !json.is_object() {
            return Err(SearchError::Parse("expected a JSON object".to_string()));
        }

        let section = |name: &str| {
            json.get(name)
                .and_then(|section| section.get("results"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
        };

        let results = section("web")
            .iter()
            .filter_map(|row| {
                SearchResult::new(
                    str_field(row, "title"),
                    str_field(row, "url"),
                    str_field(row, "description"),
                )
            })
            .collect();

        let videos = section("videos")
            .iter()
            .filter_map(|row| {
                VideoResult::new(
                    str_field(row, "title"),
                    str_field(row, "url"),
                    row.pointer("/thumbnail/src").and_then(Value::as_str),
                    row.pointer("/video/duration").and_then(Value::as_str),
                )
            })
            .collect();

        Ok(SearchResponse {
            results,
            images: Vec::new(),
            videos,
        })
    }
}

#[async_trait]
impl SearchProvider for BraveSearch {
    fn name(&self) -> &str {
        "brave"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn query(&self, text: &str) -> Result<SearchResponse, SearchError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| SearchError::AuthError("No Brave API key configured".to_string()))?;

        tracing::debug!("[SEARCH] brave query: {}", text);

        let count = self.max_results.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json")
            .query(&[("q", text), ("count", count.as_str())])
            .send()
            .await
            .map_err(request_error)?;

        Self::parse_response(&read_json(response).await?)
    }
}
