// Recursive factorial command
//
// The outermost step runs on the caller; every step below it is submitted to
// the same limiter and awaited while still occupying a worker. With fewer
// than n-1 workers the chain can never finish; the command reports the stall
// instead of hanging.

use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use pclimit::{ConcurrencyLimiter, LimiterConfig, QueueSnapshot};
use serde::Serialize;
use tracing::warn;

use crate::output::{print_field, OutputFormat};

#[derive(Debug, Serialize)]
pub struct FactorialReport {
    pub n: u64,
    pub concurrency: usize,
    pub value: Option<u64>,
    pub stalled: bool,
    pub stats: QueueSnapshot,
}

fn pc_factorial(n: u64, limiter: ConcurrencyLimiter) -> BoxFuture<'static, Result<u64>> {
    async move {
        if n <= 1 {
            return Ok(1);
        }
        let nested = limiter.clone();
        let step = limiter.run(move || pc_factorial(n - 1, nested))?;
        let below = step.await?;
        n.checked_mul(below)
            .ok_or_else(|| anyhow::anyhow!("{}! overflows u64", n))
    }
    .boxed()
}

pub async fn factorial(n: u64, timeout: Duration, config: LimiterConfig) -> Result<FactorialReport> {
    let concurrency = config.queue.concurrency;
    let limiter = ConcurrencyLimiter::with_config(config)?;

    let report = match tokio::time::timeout(timeout, pc_factorial(n, limiter.clone())).await {
        Ok(value) => {
            limiter.drain_and_stop().await?;
            FactorialReport {
                n,
                concurrency,
                value: Some(value?),
                stalled: false,
                stats: limiter.stats(),
            }
        }
        Err(_) => {
            let stats = limiter.stats();
            warn!(
                n,
                concurrency,
                in_flight = stats.in_flight,
                pending = stats.pending,
                "Factorial stalled: every worker waits on a step that cannot start"
            );
            limiter.abort();
            FactorialReport {
                n,
                concurrency,
                value: None,
                stalled: true,
                stats,
            }
        }
    };
    Ok(report)
}

pub async fn run(n: u64, timeout_ms: u64, config: LimiterConfig, output: OutputFormat) -> Result<()> {
    let report = factorial(n, Duration::from_millis(timeout_ms), config).await?;

    if output.is_text() {
        print_field("n", &report.n.to_string());
        print_field("Concurrency", &report.concurrency.to_string());
        match report.value {
            Some(value) => print_field("Result", &value.to_string()),
            None => {
                print_field("Result", "stalled");
                print_field("Running", &report.stats.in_flight.to_string());
                print_field("Queued", &report.stats.pending.to_string());
            }
        }
    } else {
        output.print_value(&report)?;
    }
    Ok(())
}
