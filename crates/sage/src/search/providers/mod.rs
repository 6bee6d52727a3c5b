//! HTTP adapters for the supported web-search APIs
//!
//! Each adapter keeps its wire format private and exposes a pure
//! `parse_response` so translation can be tested without a network.

mod brave;
mod exa;
mod tavily;

pub use brave::BraveSearch;
pub use exa::ExaSearch;
pub use tavily::TavilySearch;

use reqwest::{header::RETRY_AFTER, Response};
use serde_json::Value;

use super::SearchError;

fn api_key_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|key| !key.trim().is_empty())
}

fn request_error(err: reqwest::Error) -> SearchError {
    if err.is_timeout() {
        SearchError::Timeout
    } else {
        SearchError::Network(err.to_string())
    }
}

/// Map a non-success HTTP status to a classified error
pub(crate) fn error_from_status(status: u16, retry_after_ms: Option<u64>, body: &str) -> SearchError {
    let message: String = body.chars().take(200).collect();
    match status {
        401 | 403 => SearchError::AuthError(message),
        429 => SearchError::RateLimited { retry_after_ms },
        408 | 504 => SearchError::Timeout,
        _ => SearchError::Server { status, message },
    }
}

/// Turn a response into JSON, or a classified error for non-success statuses
async fn read_json(response: Response) -> Result<Value, SearchError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64);
        let body = response.text().await.unwrap_or_default();
        return Err(error_from_status(status.as_u16(), retry_after_ms, &body));
    }

    response
        .json()
        .await
        .map_err(|e| SearchError::Parse(e.to_string()))
}

fn str_field<'a>(row: &'a Value, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(error_from_status(401, None, ""), SearchError::AuthError(_)));
        assert!(matches!(
            error_from_status(429, Some(1000), ""),
            SearchError::RateLimited {
                retry_after_ms: Some(1000)
            }
        ));
        assert!(matches!(error_from_status(504, None, ""), SearchError::Timeout));
        assert!(matches!(
            error_from_status(422, None, "bad query"),
            SearchError::Server { status: 422, .. }
        ));
    }
}
