//! Bounded worker pool over a FIFO channel
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       BoundedQueue                         │
//! │                                                            │
//! │  submit() ──► [ mpsc channel: item 0, item 1, ... ]        │
//! │                         │ (shared receiver, FIFO)          │
//! │             ┌───────────┼───────────┐                      │
//! │             ▼           ▼           ▼                      │
//! │        [worker-0]  [worker-1] ... [worker-N-1]             │
//! │             │           │           │                      │
//! │             └───────────┴───────────┴──► QueueStats        │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! At most `concurrency` items execute at once because each worker runs a
//! single item to completion before taking the next one.
//!
//! # Lifecycle
//!
//! `Active` ──drain_and_stop()──► `Draining` ──queue empty──► `Stopped`
//!
//! [`BoundedQueue::abort`] goes straight to `Stopped` and drops queued and
//! in-flight items.

mod stats;
mod worker;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
pub use stats::QueueSnapshot;
use stats::QueueStats;
use worker::{Envelope, QueueSender};

/// Queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Rejected configuration (e.g. zero concurrency)
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Submission after draining has begun
    #[error("work queue is closed to new submissions")]
    AlreadyClosed,

    /// Non-blocking submission to a full bounded queue
    #[error("work queue is full (capacity {capacity})")]
    Full { capacity: usize },

    /// The drain deadline passed with work still running
    #[error("drain timed out with {remaining} item(s) unfinished; workers aborted")]
    ShutdownTimeout { remaining: u64 },

    /// Construction outside of a tokio runtime
    #[error("work queue must be created inside a tokio runtime")]
    NoRuntime,
}

/// Queue lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Accepting submissions
    Active,
    /// Finishing queued and in-flight items, not accepting new ones
    Draining,
    /// Workers are gone
    Stopped,
}

/// An opaque unit of deferred async work
///
/// Built from a zero-argument closure producing a future. The closure is
/// called by exactly one worker, exactly once.
pub struct WorkItem {
    job: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>,
}

impl WorkItem {
    /// Wrap a closure returning a future
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            job: Box::new(move || f().boxed()),
        }
    }

    pub(crate) fn into_future(self) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.job)()
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").finish_non_exhaustive()
    }
}

/// A FIFO channel drained by a fixed number of worker loops
///
/// # Example
///
/// ```ignore
/// use pclimit::queue::{BoundedQueue, WorkItem};
///
/// let queue = BoundedQueue::new(3)?;
/// for url in urls {
///     queue.submit(WorkItem::new(move || async move {
///         fetch(url).await?;
///         Ok(())
///     }))?;
/// }
/// queue.drain_and_stop().await?;
/// ```
pub struct BoundedQueue {
    config: QueueConfig,
    sender: RwLock<Option<QueueSender>>,
    status: RwLock<QueueStatus>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    abort_handles: Vec<AbortHandle>,
    stats: Arc<QueueStats>,
    next_seq: AtomicU64,
}

impl BoundedQueue {
    /// Create a queue with `concurrency` workers and an unbounded channel
    pub fn new(concurrency: usize) -> Result<Self, QueueError> {
        Self::with_config(QueueConfig::new(concurrency))
    }

    /// Create a queue and start its workers on the current tokio runtime
    pub fn with_config(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;

        let (sender, receiver) = worker::channel(config.capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let stats = Arc::new(QueueStats::new(config.concurrency));

        let workers: Vec<JoinHandle<()>> = (0..config.concurrency)
            .map(|i| {
                let name = format!("{}-{}", config.worker_prefix, i);
                runtime.spawn(worker::run_worker(
                    name,
                    Arc::clone(&receiver),
                    Arc::clone(&stats),
                ))
            })
            .collect();
        let abort_handles = workers.iter().map(JoinHandle::abort_handle).collect();

        info!(
            concurrency = config.concurrency,
            capacity = ?config.capacity,
            "Started work queue"
        );

        Ok(Self {
            config,
            sender: RwLock::new(Some(sender)),
            status: RwLock::new(QueueStatus::Active),
            workers: Mutex::new(workers),
            abort_handles,
            stats,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Enqueue an item without waiting
    ///
    /// # Errors
    ///
    /// - [`QueueError::AlreadyClosed`] once draining has begun
    /// - [`QueueError::Full`] when a bounded channel has no room
    pub fn submit(&self, item: WorkItem) -> Result<(), QueueError> {
        let guard = self.sender.read();
        let sender = guard.as_ref().ok_or(QueueError::AlreadyClosed)?;
        let envelope = self.envelope(item);

        self.stats.item_submitted();
        let sent = match sender {
            QueueSender::Unbounded(tx) => tx.send(envelope).map_err(|_| QueueError::AlreadyClosed),
            QueueSender::Bounded(tx) => tx.try_send(envelope).map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full {
                    capacity: self.config.capacity.unwrap_or_default(),
                },
                TrySendError::Closed(_) => QueueError::AlreadyClosed,
            }),
        };
        if sent.is_err() {
            self.stats.submit_rejected();
        }
        sent
    }

    /// Enqueue an item, suspending while a bounded channel is full
    ///
    /// Behaves like [`submit`](Self::submit) on an unbounded queue.
    pub async fn submit_wait(&self, item: WorkItem) -> Result<(), QueueError> {
        let sender = self
            .sender
            .read()
            .as_ref()
            .cloned()
            .ok_or(QueueError::AlreadyClosed)?;
        let envelope = self.envelope(item);

        self.stats.item_submitted();
        let sent = match sender {
            QueueSender::Unbounded(tx) => tx.send(envelope).map_err(|_| QueueError::AlreadyClosed),
            QueueSender::Bounded(tx) => tx
                .send(envelope)
                .await
                .map_err(|_| QueueError::AlreadyClosed),
        };
        if sent.is_err() {
            self.stats.submit_rejected();
        }
        sent
    }

    fn envelope(&self, item: WorkItem) -> Envelope {
        Envelope {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            item,
        }
    }

    /// Stop accepting work, wait for queued and in-flight items, then stop
    ///
    /// Idempotent: once a drain has started, further calls return `Ok(())`
    /// immediately.
    ///
    /// # Errors
    ///
    /// [`QueueError::ShutdownTimeout`] when a drain timeout is configured and
    /// work is still running at the deadline. The workers are aborted and
    /// the remaining handles are rejected as cancelled.
    pub async fn drain_and_stop(&self) -> Result<(), QueueError> {
        self.drain().await.map(|_| ())
    }

    /// Drain, reporting whether this call performed the drain
    #[instrument(skip(self), fields(concurrency = self.config.concurrency))]
    pub(crate) async fn drain(&self) -> Result<bool, QueueError> {
        if !self.close() {
            debug!("Drain already requested");
            return Ok(false);
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        info!(pending = self.stats.snapshot().pending, "Draining work queue");

        let joined = match self.config.drain_timeout {
            Some(limit) => tokio::time::timeout(limit, join_all(workers.iter_mut()))
                .await
                .map_err(|_| limit),
            None => Ok(join_all(workers.iter_mut()).await),
        };

        let results = match joined {
            Ok(results) => results,
            Err(limit) => {
                let snapshot = self.stats.snapshot();
                let remaining = snapshot.pending + snapshot.in_flight as u64;
                warn!(
                    remaining,
                    timeout_ms = limit.as_millis() as u64,
                    "Drain timeout reached, aborting workers"
                );
                self.abort_workers();
                // Aborted workers drop their items (and with the last one, the
                // channel), so every remaining handle is rejected once this returns.
                join_all(workers).await;
                self.stats.cancel_outstanding();
                *self.status.write() = QueueStatus::Stopped;
                return Err(QueueError::ShutdownTimeout { remaining });
            }
        };

        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "Worker ended abnormally");
            }
        }

        *self.status.write() = QueueStatus::Stopped;
        let snapshot = self.stats.snapshot();
        info!(
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            "Work queue stopped"
        );
        Ok(true)
    }

    /// Close the channel and abort every worker without waiting
    ///
    /// Queued and in-flight items are dropped; their handles become
    /// rejected with [`WorkItemError::Cancelled`](crate::WorkItemError::Cancelled).
    pub fn abort(&self) {
        self.close();
        self.abort_workers();
        self.workers.lock().clear();
        *self.status.write() = QueueStatus::Stopped;
        let cancelled = self.stats.cancel_outstanding();
        warn!(cancelled, "Work queue aborted");
    }

    fn abort_workers(&self) {
        for handle in &self.abort_handles {
            handle.abort();
        }
    }

    /// Move from `Active` to `Draining` and drop the sender; false if already closed
    fn close(&self) -> bool {
        let mut status = self.status.write();
        if *status != QueueStatus::Active {
            return false;
        }
        *status = QueueStatus::Draining;
        self.sender.write().take();
        true
    }

    /// Current lifecycle status
    pub fn status(&self) -> QueueStatus {
        *self.status.read()
    }

    /// Configured concurrency bound
    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Snapshot of the queue's counters
    pub fn stats(&self) -> QueueSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn first_failure(&self) -> Option<String> {
        self.stats.first_failure()
    }
}

impl Drop for BoundedQueue {
    fn drop(&mut self) {
        if *self.status.get_mut() == QueueStatus::Active && !std::thread::panicking() {
            // The sender goes away with `self`, so workers finish what is queued and exit.
            warn!(
                pending = self.stats.snapshot().pending,
                "Work queue dropped without drain_and_stop; remaining work continues in the background"
            );
        }
    }
}
