//! Web search: provider adapters and ordered fallback across them

mod fallback;
pub mod providers;
mod types;

use std::sync::Arc;

pub use fallback::{AttemptOutcome, ProviderAttemptLog, ProviderFallbackSearch, SearchOutcome};
pub use providers::{BraveSearch, ExaSearch, TavilySearch};
pub use types::{
    ImageResult, Perspective, SearchError, SearchProvider, SearchResponse, SearchResult,
    VideoResult,
};

use crate::config::SearchConfig;

/// Instantiate the configured providers in priority order.
///
/// Unknown names and providers without credentials are left out with a warning.
pub fn providers_from_config(config: &SearchConfig) -> Vec<Arc<dyn SearchProvider>> {
    let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();

    for name in &config.providers {
        let provider: Arc<dyn SearchProvider> = match name.trim().to_ascii_lowercase().as_str() {
            "tavily" => Arc::new(TavilySearch::from_env(config.max_results)),
            "exa" => Arc::new(ExaSearch::from_env(config.max_results)),
            "brave" => Arc::new(BraveSearch::from_env(config.max_results)),
            other => {
                tracing::warn!("[SEARCH] Unknown search provider '{}', ignoring", other);
                continue;
            }
        };

        if !provider.is_configured() {
            tracing::warn!("[SEARCH] {} has no API key, skipping", provider.name());
            continue;
        }
        if providers.iter().any(|p| p.name() == provider.name()) {
            continue;
        }

        tracing::info!("[SEARCH] Provider {} enabled", provider.name());
        providers.push(provider);
    }

    if providers.is_empty() {
        tracing::warn!("[SEARCH] No search providers configured; retrieval will be empty");
    }

    providers
}
