//! Diff command.
//!
//! Compresses two runs and writes the rows of the first minus the matching
//! rows of the second as collapsed stacks.

use super::convert::read_samples;
use super::models::DiffArgs;
use crate::aggregator::Compressor;
use crate::output::write_output;
use crate::parser::Mode;
use anyhow::{Context, Result};
use log::{debug, info};
use std::path::Path;
use std::time::Instant;

fn compressed(path: &Path) -> Result<(Mode, Vec<(String, String)>, Compressor)> {
    let (mode, metadata, samples) = read_samples(path)?;
    let mut compressor = Compressor::new();
    for sample in &samples {
        compressor
            .add_sample(sample)
            .with_context(|| format!("Failed to compress {}", path.display()))?;
    }
    debug!(
        "{}: {} samples in {} stacks",
        path.display(),
        samples.len(),
        compressor.len()
    );
    Ok((mode, metadata, compressor))
}

/// Execute the diff command
///
/// **Public** - main entry point called from main.rs
///
/// # Errors
/// * Either input cannot be read or is corrupt
/// * The two runs were sampled in different modes
/// * Output cannot be written
pub fn execute_diff(args: DiffArgs) -> Result<()> {
    let start_time = Instant::now();

    info!(
        "Diffing {} against {}",
        args.input.display(),
        args.baseline.display()
    );

    info!("Step 1/3: Compressing input...");
    let (mode, metadata, run) = compressed(&args.input)?;

    info!("Step 2/3: Compressing baseline...");
    let (baseline_mode, _, baseline) = compressed(&args.baseline)?;
    if baseline_mode != mode {
        anyhow::bail!(
            "Cannot diff a {} run against a {} baseline",
            mode,
            baseline_mode
        );
    }

    let delta = run.diff(&baseline).context("Failed to diff runs")?;

    info!("Step 3/3: Writing output...");
    let mut out = Vec::new();
    delta.write_collapsed(mode, &metadata, &mut out)?;
    write_output(&args.output, &out)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    info!("✓ {} stacks written to: {}", delta.len(), args.output.display());
    info!("Diff completed in {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}

/// Validate diff arguments
///
/// **Public** - can be called before execute_diff for early validation
pub fn validate_diff_args(args: &DiffArgs) -> Result<()> {
    for input in [&args.input, &args.baseline] {
        if !input.is_file() {
            anyhow::bail!("Input file does not exist: {}", input.display());
        }
    }

    if args.output.as_os_str().is_empty() {
        anyhow::bail!("Output path cannot be empty");
    }

    if args.output == args.input || args.output == args.baseline {
        anyhow::bail!("Output would overwrite an input file");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    #[test]
    fn test_validate_diff_args() {
        let input = NamedTempFile::new().unwrap();
        let baseline = NamedTempFile::new().unwrap();
        let mut args = DiffArgs {
            input: input.path().to_path_buf(),
            baseline: baseline.path().to_path_buf(),
            output: PathBuf::from("diff.txt"),
        };
        assert!(validate_diff_args(&args).is_ok());

        args.output = baseline.path().to_path_buf();
        assert!(validate_diff_args(&args).is_err());

        args.baseline = PathBuf::from("/no/such/file");
        assert!(validate_diff_args(&args).is_err());
    }
}
