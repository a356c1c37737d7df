//! Result handles for submitted work
//!
//! Every call to [`ConcurrencyLimiter::run`](crate::ConcurrencyLimiter::run)
//! returns a [`ResultHandle`]. The worker that executes the item owns the
//! matching [`Resolver`] and publishes the outcome through it exactly once.
//!
//! ```text
//! Pending ──► Resolved(T)
//!    │
//!    └──────► Rejected(WorkItemError)
//! ```
//!
//! A resolver dropped without publishing (the pool was aborted, the drain
//! timed out, the runtime shut down) rejects its handle with
//! [`WorkItemError::Cancelled`].

use std::any::Any;
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Failure of a single work item
///
/// Cheap to clone so it can be read from a handle any number of times.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkItemError {
    /// The item's body returned an error
    #[error("work item failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The item's body panicked
    #[error("work item panicked: {0}")]
    Panicked(String),

    /// The item was dropped before it produced an outcome
    #[error("work item was cancelled before it completed")]
    Cancelled,
}

impl WorkItemError {
    /// Wrap an error returned by a work item
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(error.into()))
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked(panic_message(payload))
    }

    /// Whether the item was cancelled rather than failing on its own
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from polling a handle
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandleError {
    /// The item has not finished yet; await the handle or poll again later
    #[error("result is not ready yet")]
    NotReady,

    /// The item finished with an error
    #[error(transparent)]
    Failed(#[from] WorkItemError),
}

/// Observable state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Not executed yet, or still executing
    Pending,
    /// Finished successfully
    Resolved,
    /// Finished with an error, panicked or was cancelled
    Rejected,
}

enum Slot<T> {
    Pending,
    Resolved(T),
    Rejected(WorkItemError),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    completed: Notify,
}

impl<T> Shared<T> {
    fn complete(&self, outcome: Result<T, WorkItemError>) {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Pending) {
                return;
            }
            *slot = match outcome {
                Ok(value) => Slot::Resolved(value),
                Err(error) => Slot::Rejected(error),
            };
        }
        self.completed.notify_waiters();
    }

    fn take_outcome(&self) -> Option<Result<T, WorkItemError>> {
        match std::mem::replace(&mut *self.slot.lock(), Slot::Pending) {
            Slot::Pending => None,
            Slot::Resolved(value) => Some(Ok(value)),
            Slot::Rejected(error) => Some(Err(error)),
        }
    }
}

/// Create a connected resolver/handle pair
pub(crate) fn channel<T>(id: u64) -> (Resolver<T>, ResultHandle<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        completed: Notify::new(),
    });

    (
        Resolver {
            shared: Some(Arc::clone(&shared)),
        },
        ResultHandle { id, shared },
    )
}

/// Write side of a handle, moved into the work item
pub(crate) struct Resolver<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Resolver<T> {
    pub(crate) fn resolve(mut self, outcome: Result<T, WorkItemError>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(outcome);
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(WorkItemError::Cancelled));
        }
    }
}

/// Eventual outcome of one submitted work item
///
/// The handle can be polled ([`result`](Self::result)), awaited by
/// reference ([`wait`](Self::wait)), awaited by value (`handle.await`), or
/// simply dropped. Dropping a handle does not cancel the work; any error
/// the item produces is then only visible in the logs.
///
/// # Example
///
/// ```ignore
/// let handle = limiter.run(|| async { Ok::<_, std::io::Error>(21 * 2) })?;
/// assert_eq!(handle.await?, 42);
/// ```
pub struct ResultHandle<T> {
    id: u64,
    shared: Arc<Shared<T>>,
}

impl<T> ResultHandle<T> {
    /// Submission sequence number within the owning limiter
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> HandleState {
        match *self.shared.slot.lock() {
            Slot::Pending => HandleState::Pending,
            Slot::Resolved(_) => HandleState::Resolved,
            Slot::Rejected(_) => HandleState::Rejected,
        }
    }

    /// Whether the item has finished, successfully or not
    pub fn is_resolved(&self) -> bool {
        self.state() != HandleState::Pending
    }

    /// Whether the item finished with an error
    pub fn is_rejected(&self) -> bool {
        self.state() == HandleState::Rejected
    }
}

impl<T: Clone> ResultHandle<T> {
    /// Read the outcome without waiting
    ///
    /// # Errors
    ///
    /// [`HandleError::NotReady`] while the item is pending, or the item's
    /// own error once it has been rejected.
    pub fn result(&self) -> Result<T, HandleError> {
        match &*self.shared.slot.lock() {
            Slot::Pending => Err(HandleError::NotReady),
            Slot::Resolved(value) => Ok(value.clone()),
            Slot::Rejected(error) => Err(HandleError::Failed(error.clone())),
        }
    }

    /// Suspend until the item finishes and return a copy of its outcome
    pub async fn wait(&self) -> Result<T, WorkItemError> {
        loop {
            // Register before checking so a completion in between is not missed.
            let notified = self.shared.completed.notified();
            match self.result() {
                Ok(value) => return Ok(value),
                Err(HandleError::Failed(error)) => return Err(error),
                Err(HandleError::NotReady) => notified.await,
            }
        }
    }
}

impl<T: Send + 'static> IntoFuture for ResultHandle<T> {
    type Output = Result<T, WorkItemError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            loop {
                let notified = self.shared.completed.notified();
                if let Some(outcome) = self.shared.take_outcome() {
                    return outcome;
                }
                notified.await;
            }
        })
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
