use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{api_key_from_env, read_json, request_error, str_field};
use crate::search::{ImageResult, SearchError, SearchProvider, SearchResponse, SearchResult};

const ENDPOINT: &str = "https://api.tavily.com/search";

/// Tavily search API; also the main source of images
pub struct TavilySearch {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    max_results: usize,
}

impl TavilySearch {
    pub fn new(api_key: Option<String>, max_results: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: ENDPOINT.to_string(),
            max_results,
        }
    }

    /// Reads `TAVILY_API_KEY`
    pub fn from_env(max_results: usize) -> Self {
        Self::new(api_key_from_env("TAVILY_API_KEY"), max_results)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_payload(&self, query: &str) -> Value {
        json!({
            "query": query,
            "max_results": self.max_results,
            "search_depth": "basic",
            "include_images": true,
            "include_image_descriptions": true,
        })
    }

    pub(crate) fn parse_response(json: &Value) -> Result<SearchResponse, SearchError> {
        let rows = json
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| SearchError::Parse("missing results array".to_string()))?;

        let results = rows
            .iter()
            .filter_map(|row| {
                SearchResult::new(str_field(row, "title"), str_field(row, "url"), str_field(row, "content"))
            })
            .collect();

        // Plain URL strings, or objects once image descriptions are requested
        let images = json
            .get("images")
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|image| match image {
                        Value::String(url) => ImageResult::new(url, "", None),
                        other => ImageResult::new(
                            str_field(other, "url"),
                            str_field(other, "description"),
                            None,
                        ),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(SearchResponse {
            results,
            images,
            videos: Vec::new(),
        })
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn query(&self, text: &str) -> Result<SearchResponse, SearchError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| SearchError::AuthError("No Tavily API key configured".to_string()))?;

        tracing::debug!("[SEARCH] tavily query: {}", text);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&self.build_payload(text))
            .send()
            .await
            .map_err(request_error)?;

        Self::parse_response(&read_json(response).await?)
    }
}
