//! Rate-limited FIFO work queue
//!
//! One queue per rate-limited dependency. A single worker task drains jobs in
//! enqueue order and never runs two of them at once. Before every attempt
//! (including retries) the worker passes a sliding admission window, so no more
//! than `max_requests_per_window` attempts start inside any `window_length`.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::QueueConfig,
    retry::{Classify, FailureClass, RetryError, RetryExecutor, RetryPolicy},
};

type Job = BoxFuture<'static, ()>;

/// Error returned to the caller of [`RateLimitedQueue::enqueue`]
#[derive(Debug, thiserror::Error)]
pub enum QueueError<E> {
    #[error("queue worker has shut down")]
    Closed,

    #[error("{0}")]
    Retry(RetryError<E>),
}

impl<E> From<RetryError<E>> for QueueError<E> {
    fn from(err: RetryError<E>) -> Self {
        QueueError::Retry(err)
    }
}

impl<E> QueueError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Retry(err) if err.is_cancelled())
    }
}

impl<E: Classify> Classify for QueueError<E> {
    fn classify(&self) -> FailureClass {
        match self {
            QueueError::Closed => FailureClass::Fatal,
            QueueError::Retry(RetryError::Fatal { error, .. }) => error.classify(),
            QueueError::Retry(RetryError::Exhausted { last, .. }) => last.classify(),
            QueueError::Retry(RetryError::Cancelled { .. }) => FailureClass::Fatal,
        }
    }
}

/// Rolling request counter
#[derive(Debug)]
struct AdmissionWindow {
    max_requests: u32,
    length: Duration,
    request_count: u32,
    window_start: Instant,
}

impl AdmissionWindow {
    fn new(max_requests: u32, length: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            length,
            request_count: 0,
            window_start: Instant::now(),
        }
    }

    /// Take a slot if one is free, otherwise report how long until the window resets
    fn try_reserve(&mut self, now: Instant) -> Option<Duration> {
        if now.duration_since(self.window_start) >= self.length {
            self.request_count = 0;
            self.window_start = now;
        }
        if self.request_count < self.max_requests {
            self.request_count += 1;
            return None;
        }
        Some((self.window_start + self.length).saturating_duration_since(now))
    }
}

fn reserve(window: &Mutex<AdmissionWindow>) -> Option<Duration> {
    window
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .try_reserve(Instant::now())
}

async fn admit(queue_name: &str, window: &Mutex<AdmissionWindow>) {
    while let Some(wait) = reserve(window) {
        tracing::info!("[QUEUE] {} window full, holding next request for {:?}", queue_name, wait);
        tokio::time::sleep(wait).await;
    }
}

/// Serialized admission-control queue for one dependency.
///
/// Cloning yields another handle to the same worker. The worker stops once
/// every handle has been dropped and the backlog is drained. Must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct RateLimitedQueue {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Job>,
    window: Arc<Mutex<AdmissionWindow>>,
    retry: RetryExecutor,
    pending: Arc<AtomicUsize>,
}

impl fmt::Debug for RateLimitedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl RateLimitedQueue {
    pub fn new(
        name: impl Into<String>,
        max_requests_per_window: u32,
        window_length: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_worker(name.clone(), receiver, pending.clone()));

        tracing::debug!(
            "[QUEUE] {} started: {} requests per {:?}",
            name,
            max_requests_per_window,
            window_length
        );

        Self {
            name,
            sender,
            window: Arc::new(Mutex::new(AdmissionWindow::new(
                max_requests_per_window,
                window_length,
            ))),
            retry: RetryExecutor::new(retry_policy),
            pending,
        }
    }

    /// Build a queue from configuration; `timeout` bounds each attempt
    pub fn from_config(name: impl Into<String>, config: &QueueConfig, timeout: Duration) -> Self {
        Self::new(
            name,
            config.max_requests_per_window,
            config.window_length(),
            config.retry_policy(timeout),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs enqueued but not yet finished
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn enqueue<T, E, F, Fut>(&self, operation: F) -> Result<T, QueueError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Classify + fmt::Display + Send + 'static,
    {
        self.enqueue_with_cancel(&CancellationToken::new(), operation)
            .await
    }

    /// Append `operation` to the queue and wait for its result.
    ///
    /// A job whose caller has gone away or whose token is cancelled by the time
    /// it reaches the front is skipped without consuming a window slot.
    pub async fn enqueue_with_cancel<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, QueueError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Classify + fmt::Display + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let name = self.name.clone();
        let window = self.window.clone();
        let retry = self.retry.clone();
        let cancel = cancel.clone();

        let job: Job = Box::pin(async move {
            if reply.is_closed() {
                tracing::debug!("[QUEUE] {} skipping job abandoned by its caller", name);
                return;
            }
            let operation = &operation;
            let outcome = retry
                .execute_gated(
                    &name,
                    &cancel,
                    || admit(&name, &window),
                    || operation(),
                )
                .await;
            let _ = reply.send(outcome);
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }

        match result.await {
            Ok(outcome) => outcome.map_err(QueueError::from),
            Err(_) => Err(QueueError::Closed),
        }
    }
}

async fn run_worker(
    name: Arc<str>,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(job) = receiver.recv().await {
        job.await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("[QUEUE] {} worker stopped", name);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::testing::TestError;

    fn queue(max: u32, window_ms: u64) -> RateLimitedQueue {
        RateLimitedQueue::new(
            "test",
            max,
            Duration::from_millis(window_ms),
            RetryPolicy::rate_limit_only(3, Duration::from_millis(100), Duration::from_secs(5)),
        )
    }

    fn recording_op(
        starts: Arc<Mutex<Vec<Instant>>>,
        work: Duration,
    ) -> impl Fn() -> BoxFuture<'static, Result<(), TestError>> + Send + Sync + 'static {
        move || {
            let starts = starts.clone();
            Box::pin(async move {
                starts.lock().unwrap().push(Instant::now());
                tokio::time::sleep(work).await;
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_admission() {
        let queue = queue(2, 60_000);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let t0 = Instant::now();

        let (a, b, c) = tokio::join!(
            queue.enqueue(recording_op(starts.clone(), Duration::ZERO)),
            queue.enqueue(recording_op(starts.clone(), Duration::ZERO)),
            queue.enqueue(recording_op(starts.clone(), Duration::ZERO)),
        );
        assert_ok!(a);
        assert_ok!(b);
        assert_ok!(c);

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[0] - t0, Duration::ZERO);
        assert_eq!(starts[1] - t0, Duration::ZERO);
        assert_eq!(starts[2] - t0, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_request_waits_only_for_remaining_window() {
        let queue = queue(2, 60_000);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let t0 = Instant::now();

        let (a, b, c) = tokio::join!(
            queue.enqueue(recording_op(starts.clone(), Duration::from_secs(10))),
            queue.enqueue(recording_op(starts.clone(), Duration::from_secs(10))),
            queue.enqueue(recording_op(starts.clone(), Duration::ZERO)),
        );
        assert_ok!(a);
        assert_ok!(b);
        assert_ok!(c);

        let starts = starts.lock().unwrap();
        assert_eq!(starts[1] - t0, Duration::from_secs(10));
        assert_eq!(starts[2] - t0, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_never_overlap() {
        let queue = queue(100, 1_000);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waits = Vec::new();
        for i in 0..5u32 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let order = order.clone();
            let queue = queue.clone();
            waits.push(tokio::spawn(async move {
                queue
                    .enqueue(move || {
                        let running = running.clone();
                        let max_seen = max_seen.clone();
                        let order = order.clone();
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            order.lock().unwrap().push(i);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, TestError>(i)
                        }
                    })
                    .await
            }));
            // Deterministic enqueue order
            tokio::task::yield_now().await;
        }

        for wait in waits {
            assert_ok!(wait.await.unwrap());
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_attempt_is_retried() {
        let queue = queue(10, 60_000);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = queue
            .enqueue(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TestError::RateLimited)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(assert_ok!(result), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_consume_window_slots() {
        let queue = queue(1, 10_000);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let t0 = Instant::now();

        let recorded = starts.clone();
        let result = queue
            .enqueue(move || {
                let recorded = recorded.clone();
                async move {
                    let mut starts = recorded.lock().unwrap();
                    starts.push(Instant::now());
                    if starts.len() == 1 {
                        Err(TestError::RateLimited)
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_ok!(result);
        let starts = starts.lock().unwrap();
        assert_eq!(starts[1] - t0, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rate_limit_errors_pass_through() {
        let queue = queue(10, 60_000);
        let result: Result<(), _> = queue.enqueue(|| async { Err(TestError::Network) }).await;

        let error = assert_err!(result);
        assert!(matches!(
            error,
            QueueError::Retry(RetryError::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(error.classify(), FailureClass::Retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_is_skipped() {
        let queue = queue(10, 60_000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = queue
            .enqueue_with_cancel(&cancel, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, TestError>(()) }
            })
            .await;

        assert!(assert_err!(result).is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
