//! Concurrency limiter
//!
//! "Call this, but never let more than N run at once." Wraps each closure
//! into a [`WorkItem`], submits it to an internal [`BoundedQueue`] and hands
//! back a [`ResultHandle`] for the outcome.
//!
//! # Nested submission
//!
//! A work item may submit more work to the same limiter (the limiter is
//! cheap to clone). If it then waits for that nested work while holding its
//! worker, and every worker ends up doing the same, nothing is left to run
//! the nested items and the limiter deadlocks. A recursive computation with
//! depth ≥ `concurrency` hits this. Use a drain timeout or
//! [`ConcurrencyLimiter::abort`] to recover.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::warn;

use crate::config::LimiterConfig;
use crate::handle::{self, ResultHandle, WorkItemError};
use crate::queue::{BoundedQueue, QueueError, QueueSnapshot, QueueStatus, WorkItem};

/// Limiter errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    /// Error from the underlying queue
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Items failed and `fail_on_worker_errors` is enabled
    #[error("{failed} work item(s) failed; first failure: {first}")]
    WorkerFailures { failed: u64, first: String },
}

impl LimiterError {
    /// Whether this is a submission after draining began
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Queue(QueueError::AlreadyClosed))
    }
}

struct LimiterInner {
    queue: BoundedQueue,
    config: LimiterConfig,
    next_id: AtomicU64,
}

/// Runs async closures with at most `concurrency` executing at once
///
/// Lifecycle: `Active` (accepting `run`) → `Draining` → `Stopped`.
///
/// # Example
///
/// ```ignore
/// use pclimit::ConcurrencyLimiter;
///
/// let results = ConcurrencyLimiter::scope(3, |limiter| async move {
///     let mut handles = Vec::new();
///     for path in paths {
///         handles.push(limiter.run(move || tokio::fs::read_to_string(path))?);
///     }
///     Ok::<_, pclimit::LimiterError>(handles)
/// })
/// .await??;
///
/// // Every handle is resolved once the scope returns.
/// for handle in results {
///     println!("{}", handle.await?.len());
/// }
/// ```
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `concurrency` workers
    pub fn new(concurrency: usize) -> Result<Self, LimiterError> {
        Self::with_config(LimiterConfig::new(concurrency))
    }

    /// Create a limiter from a full configuration
    pub fn with_config(config: LimiterConfig) -> Result<Self, LimiterError> {
        let queue = BoundedQueue::with_config(config.queue.clone())?;
        Ok(Self {
            inner: Arc::new(LimiterInner {
                queue,
                config,
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Run `body` with a fresh limiter, then drain it
    ///
    /// Returns only after every item submitted inside the scope has finished.
    pub async fn scope<F, Fut, R>(concurrency: usize, body: F) -> Result<R, LimiterError>
    where
        F: FnOnce(ConcurrencyLimiter) -> Fut,
        Fut: Future<Output = R>,
    {
        Self::scope_with(LimiterConfig::new(concurrency), body).await
    }

    /// [`scope`](Self::scope) with a full configuration
    pub async fn scope_with<F, Fut, R>(config: LimiterConfig, body: F) -> Result<R, LimiterError>
    where
        F: FnOnce(ConcurrencyLimiter) -> Fut,
        Fut: Future<Output = R>,
    {
        let limiter = Self::with_config(config)?;
        let output = body(limiter.clone()).await;
        limiter.drain_and_stop().await?;
        Ok(output)
    }

    /// Submit `f` for execution and return its handle immediately
    ///
    /// # Errors
    ///
    /// - `Queue(AlreadyClosed)` once draining has begun
    /// - `Queue(Full)` when a bounded queue has no room (see [`run_wait`](Self::run_wait))
    pub fn run<F, Fut, T, E>(&self, f: F) -> Result<ResultHandle<T>, LimiterError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let (item, handle) = self.wrap(f);
        self.inner.queue.submit(item)?;
        Ok(handle)
    }

    /// Submit `f(args)`; the call itself happens on a worker
    pub fn run_with<F, A, Fut, T, E>(&self, f: F, args: A) -> Result<ResultHandle<T>, LimiterError>
    where
        F: FnOnce(A) -> Fut + Send + 'static,
        A: Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.run(move || f(args))
    }

    /// Like [`run`](Self::run), but waits for room in a bounded queue
    pub async fn run_wait<F, Fut, T, E>(&self, f: F) -> Result<ResultHandle<T>, LimiterError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let (item, handle) = self.wrap(f);
        self.inner.queue.submit_wait(item).await?;
        Ok(handle)
    }

    fn wrap<F, Fut, T, E>(&self, f: F) -> (WorkItem, ResultHandle<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (resolver, handle) = handle::channel(id);

        let item = WorkItem::new(move || async move {
            let outcome = match AssertUnwindSafe(async move { f().await }).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(WorkItemError::failed(error)),
                Err(payload) => Err(WorkItemError::from_panic(&*payload)),
            };

            let failure = outcome.as_ref().err().cloned();
            resolver.resolve(outcome);

            // Surface the failure to the worker loop too, so it is logged and counted.
            match failure {
                Some(error) => Err(anyhow::Error::new(error)),
                None => Ok(()),
            }
        });

        (item, handle)
    }

    /// Stop accepting work and wait for everything submitted to finish
    ///
    /// Idempotent. With `fail_on_worker_errors`, the call that performed the
    /// drain reports failed items after the queue has fully drained.
    pub async fn drain_and_stop(&self) -> Result<(), LimiterError> {
        let drained = self.inner.queue.drain().await?;

        if drained && self.inner.config.fail_on_worker_errors {
            let failed = self.inner.queue.stats().failed;
            if failed > 0 {
                let first = self.inner.queue.first_failure().unwrap_or_default();
                warn!(failed, first = %first, "Limiter drained with failed work items");
                return Err(LimiterError::WorkerFailures { failed, first });
            }
        }
        Ok(())
    }

    /// Abort all workers immediately; pending handles become cancelled
    pub fn abort(&self) {
        self.inner.queue.abort();
    }

    /// Current lifecycle status
    pub fn status(&self) -> QueueStatus {
        self.inner.queue.status()
    }

    /// Configured concurrency bound
    pub fn concurrency(&self) -> usize {
        self.inner.queue.concurrency()
    }

    /// Limiter configuration
    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    /// Snapshot of the underlying queue's counters
    pub fn stats(&self) -> QueueSnapshot {
        self.inner.queue.stats()
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("concurrency", &self.concurrency())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleError, HandleState};
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_run_returns_before_execution() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let handle = limiter
            .run(move || async move {
                release_rx.await.ok();
                Ok::<_, Infallible>(7)
            })
            .unwrap();

        assert_eq!(handle.state(), HandleState::Pending);
        assert!(matches!(handle.result(), Err(HandleError::NotReady)));

        release_tx.send(()).unwrap();
        assert_eq!(handle.wait().await.unwrap(), 7);
        assert!(handle.is_resolved());
        limiter.drain_and_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_with_passes_arguments() {
        async fn add(pair: (u32, u32)) -> Result<u32, Infallible> {
            Ok(pair.0 + pair.1)
        }

        let limiter = ConcurrencyLimiter::new(2).unwrap();
        let handle = limiter.run_with(add, (40, 2)).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
        limiter.drain_and_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_is_attached_to_its_handle() {
        let limiter = ConcurrencyLimiter::new(2).unwrap();
        let handle = limiter
            .run(|| async { Err::<u32, _>(std::io::Error::other("disk on fire")) })
            .unwrap();
        limiter.drain_and_stop().await.unwrap();

        let err = handle.result().unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert_eq!(limiter.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_panic_is_attached_to_its_handle() {
        async fn explode() -> Result<u32, Infallible> {
            panic!("kaboom")
        }

        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let handle = limiter.run(explode).unwrap();
        let ok = limiter.run(|| async { Ok::<_, Infallible>(1) }).unwrap();
        limiter.drain_and_stop().await.unwrap();

        match handle.result() {
            Err(HandleError::Failed(WorkItemError::Panicked(message))) => {
                assert_eq!(message, "kaboom")
            }
            other => panic!("expected a panic rejection, got {other:?}"),
        }
        assert_eq!(ok.result().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_after_drain_is_closed() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        limiter.drain_and_stop().await.unwrap();

        let err = limiter
            .run(|| async { Ok::<_, Infallible>(()) })
            .unwrap_err();
        assert!(err.is_closed());
        assert_eq!(limiter.status(), QueueStatus::Stopped);
    }

    #[tokio::test]
    async fn test_fail_on_worker_errors_reports_once() {
        let limiter =
            ConcurrencyLimiter::with_config(LimiterConfig::new(2).with_fail_on_worker_errors(true))
                .unwrap();

        let ok = limiter.run(|| async { Ok::<_, Infallible>("fine") }).unwrap();
        let bad = limiter
            .run(|| async { Err::<(), _>(anyhow::anyhow!("bad input")) })
            .unwrap();

        match limiter.drain_and_stop().await {
            Err(LimiterError::WorkerFailures { failed, first }) => {
                assert_eq!(failed, 1);
                assert!(first.contains("bad input"));
            }
            other => panic!("expected WorkerFailures, got {other:?}"),
        }
        // Everything drained regardless.
        assert_eq!(ok.result().unwrap(), "fine");
        assert!(bad.is_rejected());
        // A second drain has nothing new to report.
        limiter.drain_and_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_drains_before_returning() {
        let handles = ConcurrencyLimiter::scope(2, |limiter| async move {
            (0..6_u64)
                .map(|i| {
                    limiter.run(move || async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, Infallible>(i * i)
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .unwrap()
        .unwrap();

        let values: Vec<u64> = handles.iter().map(|h| h.result().unwrap()).collect();
        assert_eq!(values, vec![0, 1, 4, 9, 16, 25]);
    }

    #[tokio::test]
    async fn test_run_wait_applies_backpressure() {
        let limiter = ConcurrencyLimiter::with_config(LimiterConfig::new(1).with_capacity(1)).unwrap();

        let first = limiter.run(|| async { Ok::<_, Infallible>(1) }).unwrap();
        let full = limiter.run(|| async { Ok::<_, Infallible>(2) }).unwrap_err();
        assert!(matches!(full, LimiterError::Queue(QueueError::Full { capacity: 1 })));

        let second = limiter
            .run_wait(|| async { Ok::<_, Infallible>(3) })
            .await
            .unwrap();
        limiter.drain_and_stop().await.unwrap();

        assert_eq!(first.result().unwrap(), 1);
        assert_eq!(second.result().unwrap(), 3);
    }
}
