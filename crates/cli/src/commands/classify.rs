// Even/odd classification command
//
// Pushes `count` tiny work items through the limiter. Each item classifies
// one number; the totals show nothing was lost or run twice.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use pclimit::{ConcurrencyLimiter, LimiterConfig, QueueSnapshot};
use serde::Serialize;
use tracing::info;

use crate::output::{print_field, OutputFormat};

#[derive(Debug, Serialize)]
pub struct ClassifyReport {
    pub count: u64,
    pub concurrency: usize,
    pub even: u64,
    pub odd: u64,
    pub elapsed_ms: u64,
    pub stats: QueueSnapshot,
}

pub async fn classify(count: u64, config: LimiterConfig) -> Result<ClassifyReport> {
    let concurrency = config.queue.concurrency;
    let even = Arc::new(AtomicU64::new(0));
    let odd = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let limiter = ConcurrencyLimiter::with_config(config)?;
    for n in 0..count {
        let even = Arc::clone(&even);
        let odd = Arc::clone(&odd);
        limiter
            .run_wait(move || async move {
                if n % 2 == 0 {
                    even.fetch_add(1, Ordering::Relaxed);
                } else {
                    odd.fetch_add(1, Ordering::Relaxed);
                }
                Ok::<_, Infallible>(())
            })
            .await?;

        if n % 100_000 == 0 {
            info!(produced = n, "Classification items submitted");
        }
        if n % 1_000 == 0 {
            tokio::task::yield_now().await;
        }
    }
    limiter.drain_and_stop().await?;

    Ok(ClassifyReport {
        count,
        concurrency,
        even: even.load(Ordering::Relaxed),
        odd: odd.load(Ordering::Relaxed),
        elapsed_ms: start.elapsed().as_millis() as u64,
        stats: limiter.stats(),
    })
}

pub async fn run(count: u64, config: LimiterConfig, output: OutputFormat) -> Result<()> {
    let report = classify(count, config).await?;

    if output.is_text() {
        print_field("Numbers", &report.count.to_string());
        print_field("Concurrency", &report.concurrency.to_string());
        print_field("Even", &report.even.to_string());
        print_field("Odd", &report.odd.to_string());
        print_field("Peak running", &report.stats.peak_in_flight.to_string());
        print_field("Took", &format!("{} ms", report.elapsed_ms));
    } else {
        output.print_value(&report)?;
    }
    Ok(())
}
