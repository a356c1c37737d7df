//! # pclimit
//!
//! Bounded-concurrency execution of async work on tokio.
//!
//! ## Features
//!
//! - **Concurrency bound**: at most *N* submitted items execute at any instant
//! - **FIFO dequeue**: items start in submission order across the whole pool
//! - **Per-item results**: every submission gets a [`ResultHandle`] that can be
//!   polled, awaited or ignored
//! - **Failure isolation**: an error or panic in one item never stops a worker
//! - **Drain-then-stop shutdown**: wait for queued and in-flight work, with an
//!   optional deadline, or abort outright
//! - **Optional backpressure**: a bounded channel that rejects or suspends
//!   submitters when full
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConcurrencyLimiter                        │
//! │   run(f) ──► wraps f into a WorkItem + ResultHandle          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       BoundedQueue                           │
//! │   FIFO channel ──► N worker loops (one item each at a time) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::convert::Infallible;
//! use pclimit::ConcurrencyLimiter;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handles = ConcurrencyLimiter::scope(2, |limiter| async move {
//!     (1..=4_u32)
//!         .map(|n| limiter.run(move || async move { Ok::<_, Infallible>(n * 10) }))
//!         .collect::<Result<Vec<_>, _>>()
//! })
//! .await??;
//!
//! let values: Vec<u32> = handles.iter().map(|h| h.result()).collect::<Result<_, _>>()?;
//! assert_eq!(values, vec![10, 20, 30, 40]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod handle;
pub mod limiter;
pub mod queue;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{LimiterConfig, QueueConfig};
    pub use crate::handle::{HandleError, HandleState, ResultHandle, WorkItemError};
    pub use crate::limiter::{ConcurrencyLimiter, LimiterError};
    pub use crate::queue::{BoundedQueue, QueueError, QueueSnapshot, QueueStatus, WorkItem};
}

// Re-export key types at crate root
pub use config::{LimiterConfig, QueueConfig};
pub use handle::{HandleError, HandleState, ResultHandle, WorkItemError};
pub use limiter::{ConcurrencyLimiter, LimiterError};
pub use queue::{BoundedQueue, QueueError, QueueSnapshot, QueueStatus, WorkItem};
