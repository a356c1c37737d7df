// Random-sleep command
//
// Shows that N sleeping tasks overlap: total wall time ends up well below
// the sum of the individual sleeps.

use std::convert::Infallible;
use std::time::Duration;

use anyhow::{ensure, Result};
use pclimit::{ConcurrencyLimiter, LimiterConfig};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
pub struct SleepTask {
    pub index: usize,
    pub requested_ms: u64,
    pub finished_at_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SleepReport {
    pub concurrency: usize,
    pub requested_total_ms: u64,
    pub elapsed_ms: u64,
    /// requested_total / elapsed
    pub compression: f64,
    pub tasks: Vec<SleepTask>,
}

pub async fn sleep(tasks: usize, min_ms: u64, max_ms: u64, config: LimiterConfig) -> Result<SleepReport> {
    ensure!(min_ms <= max_ms, "--min-ms ({}) must not exceed --max-ms ({})", min_ms, max_ms);

    let durations: Vec<u64> = {
        let mut rng = rand::thread_rng();
        (0..tasks).map(|_| rng.gen_range(min_ms..=max_ms)).collect()
    };

    let concurrency = config.queue.concurrency;
    let start = Instant::now();
    let handles = ConcurrencyLimiter::scope_with(config, |limiter| async move {
        durations
            .iter()
            .enumerate()
            .map(|(index, &ms)| {
                limiter.run(move || async move {
                    debug!(index, ms, "Sleeping");
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, Infallible>(SleepTask {
                        index,
                        requested_ms: ms,
                        finished_at_ms: start.elapsed().as_millis() as u64,
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .await??;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let mut finished = Vec::with_capacity(handles.len());
    for handle in handles {
        finished.push(handle.await?);
    }
    let requested_total_ms: u64 = finished.iter().map(|t| t.requested_ms).sum();

    Ok(SleepReport {
        concurrency,
        requested_total_ms,
        elapsed_ms,
        compression: requested_total_ms as f64 / elapsed_ms.max(1) as f64,
        tasks: finished,
    })
}

pub async fn run(
    tasks: usize,
    min_ms: u64,
    max_ms: u64,
    config: LimiterConfig,
    output: OutputFormat,
) -> Result<()> {
    let report = sleep(tasks, min_ms, max_ms, config).await?;

    if output.is_text() {
        print_table_header(&[("TASK", 6), ("SLEEP", 8), ("DONE AT", 8)]);
        for task in &report.tasks {
            print_table_row(&[
                (&task.index.to_string(), 6),
                (&format!("{}ms", task.requested_ms), 8),
                (&format!("{}ms", task.finished_at_ms), 8),
            ]);
        }
        println!();
        print_field("Concurrency", &report.concurrency.to_string());
        print_field("Sum of sleeps", &format!("{} ms", report.requested_total_ms));
        print_field("Wall time", &format!("{} ms", report.elapsed_ms));
        print_field("Speedup", &format!("{:.2}x", report.compression));
    } else {
        output.print_value(&report)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_overlap() {
        let report = sleep(6, 100, 100, LimiterConfig::new(3)).await.unwrap();
        assert_eq!(report.requested_total_ms, 600);
        // Two waves of three.
        assert!(report.elapsed_ms >= 200 && report.elapsed_ms < 300);
        assert!(report.compression > 2.0);
        let indexes: Vec<_> = report.tasks.iter().map(|t| t.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_rejects_inverted_range() {
        let err = sleep(1, 10, 5, LimiterConfig::new(1)).await.unwrap_err();
        assert!(err.to_string().contains("--min-ms"));
    }
}
