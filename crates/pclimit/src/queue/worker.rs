//! Worker loop
//!
//! Each worker repeatedly takes the next envelope off the shared receiver
//! and runs it to completion. Failures and panics are counted and logged;
//! they never end the loop. The loop ends once the channel is closed and
//! empty.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use super::stats::QueueStats;
use super::WorkItem;
use crate::handle::panic_message;

/// A work item tagged with its submission sequence number
pub(super) struct Envelope {
    pub(super) seq: u64,
    pub(super) item: WorkItem,
}

#[derive(Clone)]
pub(super) enum QueueSender {
    Unbounded(mpsc::UnboundedSender<Envelope>),
    Bounded(mpsc::Sender<Envelope>),
}

pub(super) enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
    Bounded(mpsc::Receiver<Envelope>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<Envelope> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Create the channel; `None` capacity means unbounded
pub(super) fn channel(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

/// One receiver shared by all workers; the mutex hands it out in FIFO order
pub(super) type SharedReceiver = Arc<Mutex<QueueReceiver>>;

pub(super) async fn run_worker(name: String, receiver: SharedReceiver, stats: Arc<QueueStats>) {
    debug!(worker = %name, "Worker ready and waiting for work");

    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };

        let Some(Envelope { seq, item }) = next else {
            break;
        };

        stats.item_started();
        trace!(worker = %name, seq, "Worker picked up item");

        // The closure call happens inside the guarded future so a panic while
        // building the future is caught too.
        let outcome = AssertUnwindSafe(async move { item.into_future().await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                stats.item_succeeded();
                trace!(worker = %name, seq, "Work item completed");
            }
            Ok(Err(error)) => {
                warn!(worker = %name, seq, error = %error, "Work item failed (worker continues)");
                stats.item_failed(error.to_string());
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!(worker = %name, seq, panic = %message, "Work item panicked (worker continues)");
                stats.item_failed(format!("panicked: {message}"));
            }
        }
    }

    debug!(worker = %name, "Worker exiting: queue closed and empty");
}
