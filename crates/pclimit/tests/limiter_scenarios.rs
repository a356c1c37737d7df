//! End-to-end behaviour of the limiter under realistic workloads
//!
//! Run with: cargo test -p pclimit --test limiter_scenarios
//!
//! Timing scenarios use tokio's paused clock so they are deterministic and fast.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use pclimit::{
    ConcurrencyLimiter, HandleError, HandleState, LimiterConfig, LimiterError, QueueError,
    QueueStatus, WorkItemError,
};

/// Tracks how many items are inside their body at once
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Factorial where each step is submitted to the shared limiter and awaited
fn pc_factorial(n: u64, limiter: ConcurrencyLimiter) -> BoxFuture<'static, anyhow::Result<u64>> {
    async move {
        if n <= 1 {
            return Ok(1);
        }
        let nested = limiter.clone();
        let handle = limiter.run(move || pc_factorial(n - 1, nested))?;
        Ok(n * handle.await?)
    }
    .boxed()
}

// ============================================
// Concurrency bound
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_never_more_than_n_items_execute() {
    let concurrency = 3;
    let limiter = ConcurrencyLimiter::new(concurrency).unwrap();
    let gauge = Arc::new(Gauge::default());

    let mut handles = Vec::new();
    for i in 0..(4 * concurrency as u64) {
        let gauge = Arc::clone(&gauge);
        handles.push(
            limiter
                .run(move || async move {
                    gauge.enter();
                    tokio::time::sleep(Duration::from_millis(10 + i * 3)).await;
                    gauge.leave();
                    Ok::<_, Infallible>(i)
                })
                .unwrap(),
        );
    }
    limiter.drain_and_stop().await.unwrap();

    assert_eq!(gauge.peak(), concurrency);
    assert_eq!(limiter.stats().peak_in_flight, concurrency);
    assert!(handles.iter().all(|h| h.state() == HandleState::Resolved));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bound_holds_on_multi_thread_runtime() {
    let concurrency = 2;
    let limiter = ConcurrencyLimiter::new(concurrency).unwrap();
    let gauge = Arc::new(Gauge::default());

    for _ in 0..20 {
        let gauge = Arc::clone(&gauge);
        limiter
            .run(move || async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(5)).await;
                gauge.leave();
                Ok::<_, Infallible>(())
            })
            .unwrap();
    }
    limiter.drain_and_stop().await.unwrap();

    assert!(gauge.peak() <= concurrency);
    assert!(limiter.stats().peak_in_flight <= concurrency);
    assert_eq!(limiter.stats().succeeded, 20);
}

// ============================================
// Completeness and ordering
// ============================================

#[tokio::test]
async fn test_every_handle_settles_after_drain() {
    let limiter = ConcurrencyLimiter::new(4).unwrap();

    let handles: Vec<_> = (0..200_u32)
        .map(|i| {
            limiter
                .run(move || async move {
                    tokio::task::yield_now().await;
                    if i % 17 == 0 {
                        Err(anyhow::anyhow!("item {i} refused"))
                    } else {
                        Ok(i)
                    }
                })
                .unwrap()
        })
        .collect();

    limiter.drain_and_stop().await.unwrap();

    assert!(handles.iter().all(|h| h.is_resolved()));
    let rejected = handles.iter().filter(|h| h.is_rejected()).count();
    assert_eq!(rejected, (0..200).filter(|i| i % 17 == 0).count());
}

#[tokio::test]
async fn test_single_worker_starts_and_finishes_in_submission_order() {
    let limiter = ConcurrencyLimiter::new(1).unwrap();
    let started = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(Mutex::new(Vec::new()));

    for i in 0..25_u32 {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        limiter
            .run(move || async move {
                started.lock().push(i);
                // Later items sleep less, so only a single worker keeps them ordered.
                tokio::time::sleep(Duration::from_millis(u64::from(25 - i))).await;
                finished.lock().push(i);
                Ok::<_, Infallible>(())
            })
            .unwrap();
    }
    limiter.drain_and_stop().await.unwrap();

    let expected: Vec<u32> = (0..25).collect();
    assert_eq!(*started.lock(), expected);
    assert_eq!(*finished.lock(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_completion_order_can_differ_with_several_workers() {
    let limiter = ConcurrencyLimiter::new(2).unwrap();
    let finished = Arc::new(Mutex::new(Vec::new()));

    for (i, delay) in [(0_u32, 50_u64), (1, 10)] {
        let finished = Arc::clone(&finished);
        limiter
            .run(move || async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                finished.lock().push(i);
                Ok::<_, Infallible>(())
            })
            .unwrap();
    }
    limiter.drain_and_stop().await.unwrap();

    assert_eq!(*finished.lock(), vec![1, 0]);
}

// ============================================
// Failure isolation and shutdown
// ============================================

#[test_log::test(tokio::test)]
async fn test_failing_item_does_not_affect_siblings() {
    let limiter = ConcurrencyLimiter::new(3).unwrap();
    let failing = 4;

    let handles: Vec<_> = (0..10_u32)
        .map(|i| {
            limiter
                .run(move || async move {
                    if i == failing {
                        anyhow::bail!("item {i} failed");
                    }
                    Ok(i * 2)
                })
                .unwrap()
        })
        .collect();

    limiter.drain_and_stop().await.unwrap();

    for (i, handle) in handles.iter().enumerate() {
        if i as u32 == failing {
            let err = handle.result().unwrap_err();
            assert!(err.to_string().contains("item 4 failed"));
        } else {
            assert_eq!(handle.result().unwrap(), i as u32 * 2);
        }
    }
    let stats = limiter.stats();
    assert_eq!(stats.succeeded, 9);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_drain_is_idempotent() {
    let limiter = ConcurrencyLimiter::new(2).unwrap();
    limiter
        .run(|| async { Ok::<_, Infallible>(()) })
        .unwrap();

    limiter.drain_and_stop().await.unwrap();
    let first = limiter.stats();
    limiter.drain_and_stop().await.unwrap();

    assert_eq!(limiter.status(), QueueStatus::Stopped);
    assert_eq!(limiter.stats(), first);
}

#[tokio::test]
async fn test_nested_submission_after_drain_is_rejected() {
    let limiter = ConcurrencyLimiter::new(1).unwrap();
    let inner = limiter.clone();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (proceed_tx, proceed_rx) = tokio::sync::oneshot::channel::<()>();

    let outer = limiter
        .run(move || async move {
            started_tx.send(()).ok();
            proceed_rx.await.ok();
            // Draining has begun by now, so this late submission is refused.
            let late = inner.run(|| async { Ok::<_, Infallible>(()) });
            Ok::<_, Infallible>(late.err())
        })
        .unwrap();

    started_rx.await.unwrap();
    let drain = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.drain_and_stop().await })
    };
    while limiter.status() == QueueStatus::Active {
        tokio::task::yield_now().await;
    }
    proceed_tx.send(()).unwrap();
    drain.await.unwrap().unwrap();

    let late = outer.result().unwrap();
    assert!(matches!(late, Some(LimiterError::Queue(QueueError::AlreadyClosed))));
}

#[tokio::test]
async fn test_abort_cancels_pending_handles() {
    let limiter = ConcurrencyLimiter::new(1).unwrap();

    let stuck = limiter
        .run(|| async {
            std::future::pending::<()>().await;
            Ok::<_, Infallible>(())
        })
        .unwrap();
    let queued = limiter.run(|| async { Ok::<_, Infallible>(()) }).unwrap();
    tokio::task::yield_now().await;

    limiter.abort();

    assert!(matches!(stuck.await, Err(WorkItemError::Cancelled)));
    assert!(matches!(queued.await, Err(WorkItemError::Cancelled)));
    assert_eq!(limiter.status(), QueueStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_settles_every_handle_before_returning() {
    let limiter = ConcurrencyLimiter::with_config(
        LimiterConfig::new(1).with_drain_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let stuck = limiter
        .run(|| async {
            std::future::pending::<()>().await;
            Ok::<_, Infallible>(())
        })
        .unwrap();
    let queued = limiter.run(|| async { Ok::<_, Infallible>(()) }).unwrap();
    tokio::task::yield_now().await;

    let err = limiter.drain_and_stop().await.unwrap_err();
    assert!(matches!(
        err,
        LimiterError::Queue(QueueError::ShutdownTimeout { remaining: 2 })
    ));

    // No extra yield: both outcomes are already in place.
    assert_eq!(stuck.state(), HandleState::Rejected);
    assert_eq!(queued.state(), HandleState::Rejected);
    assert!(matches!(stuck.result(), Err(HandleError::Failed(WorkItemError::Cancelled))));

    let stats = limiter.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.finished(), stats.submitted);
}

// ============================================
// Scenario A: even/odd classification
// ============================================

#[tokio::test]
async fn test_classify_one_million_numbers() {
    const COUNT: u64 = 1_000_000;

    let even = Arc::new(Mutex::new(Vec::new()));
    let odd = Arc::new(Mutex::new(Vec::new()));

    ConcurrencyLimiter::scope(3, |limiter| {
        let even = Arc::clone(&even);
        let odd = Arc::clone(&odd);
        async move {
            for n in 0..COUNT {
                let even = Arc::clone(&even);
                let odd = Arc::clone(&odd);
                limiter.run(move || async move {
                    if n % 2 == 0 {
                        even.lock().push(n);
                    } else {
                        odd.lock().push(n);
                    }
                    Ok::<_, Infallible>(())
                })?;
                if n % 1_000 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok::<_, LimiterError>(())
        }
    })
    .await
    .unwrap()
    .unwrap();

    let mut even = std::mem::take(&mut *even.lock());
    let mut odd = std::mem::take(&mut *odd.lock());
    assert_eq!(even.len() + odd.len(), COUNT as usize);
    assert_eq!(even.len(), odd.len());

    even.sort_unstable();
    odd.sort_unstable();
    assert!(even.iter().enumerate().all(|(i, &n)| n == 2 * i as u64));
    assert!(odd.iter().enumerate().all(|(i, &n)| n == 2 * i as u64 + 1));
}

// ============================================
// Scenario B: overlapping sleeps
// ============================================

#[tokio::test(start_paused = true)]
async fn test_sleeps_overlap_with_two_workers() {
    let delays: Vec<Duration> = {
        let mut rng = rand::thread_rng();
        (0..10)
            .map(|_| Duration::from_millis(rng.gen_range(500..=1500)))
            .collect()
    };
    let total: Duration = delays.iter().sum();
    let longest = *delays.iter().max().unwrap();

    let start = Instant::now();
    let handles = ConcurrencyLimiter::scope(2, |limiter| async move {
        delays
            .into_iter()
            .map(|delay| {
                limiter.run(move || async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, Infallible>(delay)
                })
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .unwrap()
    .unwrap();
    let elapsed = start.elapsed();

    assert!(handles.iter().all(|h| h.is_resolved()));
    assert!(elapsed < longest * 10, "{elapsed:?} vs max {longest:?}");
    assert!(elapsed < total, "no overlap: {elapsed:?} vs total {total:?}");
    // Two workers can at best halve the total.
    assert!(
        elapsed + Duration::from_millis(5) >= total / 2,
        "{elapsed:?} vs half of {total:?}"
    );
}

// ============================================
// Scenario C: nested submission hazard
// ============================================

#[tokio::test(start_paused = true)]
async fn test_nested_factorial_deadlocks_when_depth_exceeds_workers() {
    let limiter = ConcurrencyLimiter::new(3).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        pc_factorial(5, limiter.clone()),
    )
    .await;
    assert!(result.is_err(), "factorial(5) should stall with 3 workers");

    // All three workers are parked on nested handles and the innermost step is still queued.
    let stats = limiter.stats();
    assert_eq!(stats.in_flight, 3);
    assert_eq!(stats.pending, 1);

    limiter.abort();
    assert_eq!(limiter.status(), QueueStatus::Stopped);
    assert_eq!(limiter.stats().cancelled, 4);
    assert_eq!(limiter.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_recovers_from_nested_deadlock() {
    let limiter = ConcurrencyLimiter::with_config(
        LimiterConfig::new(3).with_drain_timeout(Duration::from_millis(500)),
    )
    .unwrap();

    let stalled =
        tokio::time::timeout(Duration::from_secs(1), pc_factorial(5, limiter.clone())).await;
    assert!(stalled.is_err());

    match limiter.drain_and_stop().await {
        Err(LimiterError::Queue(QueueError::ShutdownTimeout { remaining })) => {
            assert_eq!(remaining, 4)
        }
        other => panic!("expected a drain timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_nested_factorial_completes_with_enough_workers() {
    let result = ConcurrencyLimiter::scope(10, |limiter| pc_factorial(5, limiter))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, 120);
}
