// pclimit CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Limiter knobs are global flags so every demo shares them.

mod commands;
mod output;
mod telemetry;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pclimit::LimiterConfig;

use crate::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "pclimit")]
#[command(about = "pclimit - Run async work with a fixed concurrency limit")]
#[command(version)]
pub struct Cli {
    /// Number of workers (maximum items running at once)
    #[arg(long, short, env = "PCLIMIT_CONCURRENCY", default_value = "3")]
    pub concurrency: usize,

    /// Bound the pending queue; submitters wait when it is full
    #[arg(long, env = "PCLIMIT_CAPACITY")]
    pub capacity: Option<usize>,

    /// Give up on draining after this many milliseconds
    #[arg(long, env = "PCLIMIT_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: Option<u64>,

    /// Fail the run if any work item failed
    #[arg(long, env = "PCLIMIT_FAIL_ON_WORKER_ERRORS")]
    pub fail_on_worker_errors: bool,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Only log warnings and errors
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify numbers as even or odd, one work item per number
    Classify {
        /// How many numbers to classify
        #[arg(long, default_value = "1000000")]
        count: u64,
    },

    /// Run tasks that sleep for a random time and report the overlap
    Sleep {
        /// Number of sleeping tasks
        #[arg(long, default_value = "10")]
        tasks: usize,

        /// Shortest sleep in milliseconds
        #[arg(long, default_value = "500")]
        min_ms: u64,

        /// Longest sleep in milliseconds
        #[arg(long, default_value = "1500")]
        max_ms: u64,
    },

    /// Compute n! where each step submits the next into the same limiter
    Factorial {
        #[arg(long, default_value = "5")]
        n: u64,

        /// Report a stall after this many milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },

    /// Read input files concurrently and write them to the last path in order
    Concat {
        /// Input files followed by the destination file
        #[arg(required = true, num_args = 2..)]
        files: Vec<PathBuf>,
    },
}

impl Cli {
    fn limiter_config(&self) -> anyhow::Result<LimiterConfig> {
        let mut config = LimiterConfig::new(self.concurrency)
            .with_fail_on_worker_errors(self.fail_on_worker_errors);
        if let Some(capacity) = self.capacity {
            config = config.with_capacity(capacity);
        }
        if let Some(ms) = self.drain_timeout_ms {
            config = config.with_drain_timeout(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig::from_env();
    init_telemetry(if cli.quiet { telemetry.quiet() } else { telemetry });

    let config = cli.limiter_config()?;
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Classify { count } => commands::classify::run(count, config, output_format).await,
        Commands::Sleep {
            tasks,
            min_ms,
            max_ms,
        } => commands::sleep::run(tasks, min_ms, max_ms, config, output_format).await,
        Commands::Factorial { n, timeout_ms } => {
            commands::factorial::run(n, timeout_ms, config, output_format).await
        }
        Commands::Concat { files } => commands::concat::run(files, config, output_format).await,
    }
}
