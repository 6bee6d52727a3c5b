//! Test doubles shared by the unit tests

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    completion::{Completion, CompletionError, CompletionRequest, CompletionService},
    retry::{Classify, FailureClass},
    search::{SearchError, SearchProvider, SearchResponse, SearchResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestError {
    Network,
    RateLimited,
    Fatal,
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestError::Network => write!(f, "network down"),
            TestError::RateLimited => write!(f, "429 too many requests"),
            TestError::Fatal => write!(f, "bad credentials"),
        }
    }
}

impl Classify for TestError {
    fn classify(&self) -> FailureClass {
        match self {
            TestError::Network => FailureClass::Retryable,
            TestError::RateLimited => FailureClass::RateLimited { retry_after: None },
            TestError::Fatal => FailureClass::Fatal,
        }
    }
}

pub fn hit(url: &str) -> SearchResult {
    SearchResult {
        title: format!("Title for {url}"),
        url: url.to_string(),
        content: format!("Content from {url}"),
    }
}

pub fn response(urls: &[&str]) -> SearchResponse {
    SearchResponse {
        results: urls.iter().map(|url| hit(url)).collect(),
        ..Default::default()
    }
}

/// Search provider that replays a script; the last entry repeats once the script runs out
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<SearchResponse, SearchError>>>,
    last: Mutex<Option<Result<SearchResponse, SearchError>>>,
    delay: Option<Duration>,
    calls: AtomicU32,
    started: Mutex<Vec<Instant>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Vec<Result<SearchResponse, SearchError>>) -> Arc<Self> {
        Arc::new(Self::build(name, script, None))
    }

    pub fn slow(
        name: &str,
        delay: Duration,
        script: Vec<Result<SearchResponse, SearchError>>,
    ) -> Arc<Self> {
        Arc::new(Self::build(name, script, Some(delay)))
    }

    pub fn returning(name: &str, urls: &[&str]) -> Arc<Self> {
        Self::new(name, vec![Ok(response(urls))])
    }

    pub fn failing(name: &str, error: SearchError) -> Arc<Self> {
        Self::new(name, vec![Err(error)])
    }

    fn build(
        name: &str,
        script: Vec<Result<SearchResponse, SearchError>>,
        delay: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            delay,
            calls: AtomicU32::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<Instant> {
        self.started.lock().unwrap().clone()
    }

    fn next(&self) -> Result<SearchResponse, SearchError> {
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(entry) => {
                *last = Some(entry.clone());
                entry
            }
            None => last.clone().unwrap_or_else(|| Ok(SearchResponse::default())),
        }
    }
}

#[async_trait]
impl SearchProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, _text: &str) -> Result<SearchResponse, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(Instant::now());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next()
    }
}

type Handler = dyn Fn(&CompletionRequest) -> Result<Completion, CompletionError> + Send + Sync;

/// Completion service answering through a closure
pub struct ScriptedCompletion {
    handler: Box<Handler>,
    calls: AtomicU32,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&CompletionRequest) -> Result<Completion, CompletionError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: CompletionError) -> Arc<Self> {
        Self::new(move |_| Err(error.clone()))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.kind.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.handler)(&request);
        self.requests.lock().unwrap().push(request);
        outcome
    }
}
