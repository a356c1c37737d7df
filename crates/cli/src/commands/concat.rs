// Concurrent file concatenation command
//
// Reads every input through the limiter, then writes them to the
// destination in argument order regardless of which read finished first.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use pclimit::{ConcurrencyLimiter, LimiterConfig};
use serde::Serialize;
use tracing::info;

use crate::output::{print_field, OutputFormat};

#[derive(Debug, Serialize)]
pub struct ConcatReport {
    pub inputs: Vec<PathBuf>,
    pub dest: PathBuf,
    pub bytes: usize,
}

pub async fn concat(inputs: &[PathBuf], dest: &Path, config: LimiterConfig) -> Result<ConcatReport> {
    ensure!(!inputs.is_empty(), "at least one input file is required");

    let handles = ConcurrencyLimiter::scope_with(config, |limiter| {
        let inputs = inputs.to_vec();
        async move {
            inputs
                .into_iter()
                .map(|path| {
                    limiter.run(move || async move {
                        tokio::fs::read(&path)
                            .await
                            .with_context(|| format!("failed to read {}", path.display()))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        }
    })
    .await??;

    let mut contents = Vec::new();
    for handle in handles {
        contents.extend_from_slice(&handle.await?);
    }

    tokio::fs::write(dest, &contents)
        .await
        .with_context(|| format!("failed to write {}", dest.display()))?;
    info!(inputs = inputs.len(), bytes = contents.len(), dest = %dest.display(), "Concatenated files");

    Ok(ConcatReport {
        inputs: inputs.to_vec(),
        dest: dest.to_path_buf(),
        bytes: contents.len(),
    })
}

pub async fn run(files: Vec<PathBuf>, config: LimiterConfig, output: OutputFormat) -> Result<()> {
    ensure!(files.len() >= 2, "usage: concat <inputs...> <dest>");
    let (dest, inputs) = files.split_last().context("missing destination file")?;
    let report = concat(inputs, dest, config).await?;

    if output.is_text() {
        print_field("Inputs", &report.inputs.len().to_string());
        print_field("Destination", &report.dest.display().to_string());
        print_field("Bytes", &report.bytes.to_string());
    } else {
        output.print_value(&report)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("pclimit-{}-{}-{}", name, std::process::id(), nanos));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_concat_preserves_argument_order() {
        let dir = scratch_dir("order");
        let mut inputs = Vec::new();
        for (i, text) in ["alpha\n", "beta\n", "gamma\n", "delta\n"].iter().enumerate() {
            let path = dir.join(format!("in-{}.txt", i));
            std::fs::write(&path, text).unwrap();
            inputs.push(path);
        }
        let dest = dir.join("out.txt");

        let report = concat(&inputs, &dest, LimiterConfig::new(3)).await.unwrap();

        assert_eq!(report.bytes, 23);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "alpha\nbeta\ngamma\ndelta\n");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_input_is_reported() {
        let dir = scratch_dir("missing");
        let present = dir.join("present.txt");
        std::fs::write(&present, "x").unwrap();
        let inputs = vec![present, dir.join("absent.txt")];

        let err = concat(&inputs, &dir.join("out.txt"), LimiterConfig::new(2))
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("absent.txt"));
        assert!(!dir.join("out.txt").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_run_needs_a_destination() {
        let err = run(vec![PathBuf::from("only.txt")], LimiterConfig::new(1), OutputFormat::Text)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("usage"));
    }
}
