use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use super::{Completion, CompletionError, CompletionRequest, CompletionService};

/// Cache key for completion responses
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct CacheKey {
    content_hash: u64,
    kind: String,
}

impl CacheKey {
    fn new(request: &CompletionRequest) -> Self {
        let mut hasher = DefaultHasher::new();
        request.system_prompt.hash(&mut hasher);
        request.user_prompt.hash(&mut hasher);
        request.options.temperature.map(f32::to_bits).hash(&mut hasher);
        request.options.max_tokens.hash(&mut hasher);
        request.options.json_mode.hash(&mut hasher);

        Self {
            content_hash: hasher.finish(),
            kind: request.kind.clone(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}

/// Memoizes successful completions of an inner service. Errors are never cached.
pub struct CachedCompletion<S> {
    inner: S,
    cache: Cache<CacheKey, Completion>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: CompletionService> CachedCompletion<S> {
    pub fn new(inner: S, max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self {
            inner,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entry_count: self.cache.entry_count(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl<S: CompletionService> CompletionService for CachedCompletion<S> {
    fn is_configured(&self) -> bool {
        self.inner.is_configured()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let key = CacheKey::new(&request);

        if let Some(cached) = self.cache.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[COMPLETION] Cache hit for {} request", request.kind);
            return Ok(cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let completion = self.inner.complete(request).await?;
        self.cache.insert(key, completion.clone()).await;
        Ok(completion)
    }
}
