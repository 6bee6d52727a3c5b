use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{api_key_from_env, read_json, request_error, str_field};
use crate::search::{ImageResult, SearchError, SearchProvider, SearchResponse, SearchResult};

const ENDPOINT: &str = "https://api.exa.ai/search";
const MAX_TEXT_CHARS: usize = 1_000;

/// Exa neural search API
pub struct ExaSearch {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    max_results: usize,
}

impl ExaSearch {
    pub fn new(api_key: Option<String>, max_results: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: ENDPOINT.to_string(),
            max_results,
        }
    }

    /// Reads `EXA_API_KEY`
    pub fn from_env(max_results: usize) -> Self {
        Self::new(api_key_from_env("EXA_API_KEY"), max_results)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_payload(&self, query: &str) -> Value {
        json!({
            "query": query,
            "numResults": self.max_results,
            "type": "auto",
            "contents": { "text": { "maxCharacters": MAX_TEXT_CHARS } }
        })
    }

    pub(crate) fn parse_response(json: &Value) -> Result<SearchResponse, SearchError> {
        let rows = json
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| SearchError::Parse("missing results array".to_string()))?;

        let mut response = SearchResponse::default();
        for row in rows {
            let Some(result) =
                SearchResult::new(str_field(row, "title"), str_field(row, "url"), str_field(row, "text"))
            else {
                continue;
            };

            if let Some(image) = row
                .get("image")
                .and_then(Value::as_str)
                .and_then(|image| ImageResult::new(image, &result.title, Some(&result.url)))
            {
                response.images.push(image);
            }
            response.results.push(result);
        }

        Ok(response)
    }
}

#[async_trait]
impl SearchProvider for ExaSearch {
    fn name(&self) -> &str {
        "exa"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn query(&self, text: &str) -> Result<SearchResponse, SearchError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| SearchError::AuthError("No Exa API key configured".to_string()))?;

        tracing::debug!("[SEARCH] exa query: {}", text);

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .json(&self.build_payload(text))
            .send()
            .await
            .map_err(request_error)?;

        Self::parse_response(&read_json(response).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload() {
        let payload = ExaSearch::new(None, 3).build_payload("tokio");
        assert_eq!(payload["numResults"], 3);
        assert_eq!(payload["contents"]["text"]["maxCharacters"], 1_000);
    }

    #[test]
    fn test_parse_attaches_page_images() {
        let body = json!({
            "results": [
                {
                    "title": "Tokio",
                    "url": "https://tokio.rs",
                    "text": "An async runtime",
                    "image": "https://tokio.rs/logo.png"
                },
                { "title": "No image", "url": "https://docs.rs/tokio", "text": "Docs" },
                { "title": "Bad", "url": "javascript:alert(1)", "text": "dropped" }
            ]
        });

        let response = ExaSearch::parse_response(&body).unwrap();
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].content, "An async runtime");
        assert_eq!(response.images.len(), 1);
        assert_eq!(response.images[0].source_url, "https://tokio.rs");
        assert_eq!(response.images[0].alt, "Tokio");
    }
}
