//! Conversion commands.
//!
//! Every conversion follows the same steps:
//! 1. Decode the input (collapsed text or MOJO)
//! 2. Aggregate or compress the samples
//! 3. Render the target format in memory
//! 4. Write the output file

use super::input::{decode_file, load_stats};
use super::models::{ConvertArgs, OutputFormat};
use crate::aggregator::Compressor;
use crate::output::{
    dump_collapsed, encode_pprof, export_pprof, export_speedscope, speedscope_to_vec,
    write_output, PprofOptions,
};
use crate::parser::collapsed::format_sample;
use crate::parser::{AustinEvent, Mode, Sample};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Execute a conversion
///
/// **Public** - main entry point called from main.rs
///
/// # Errors
/// * Input cannot be read or the binary stream is corrupt
/// * The export does not fit the run (e.g. metric not collected)
/// * Output cannot be written
pub fn execute_convert(args: ConvertArgs) -> Result<()> {
    let start_time = Instant::now();

    info!(
        "Converting {} to {}",
        args.input.display(),
        args.output.display()
    );

    info!("Step 1/2: Rendering {:?}...", args.format);
    let bytes = match args.format {
        OutputFormat::Compressed { counts } => render_compressed(&args, counts)?,
        OutputFormat::Collapsed { aggregate: false } => render_samples(&args)?,
        OutputFormat::Collapsed { aggregate: true } => {
            let stats = load_stats(&args.input)?;
            let mut out = Vec::new();
            dump_collapsed(&stats, &mut out).context("Failed to render collapsed stacks")?;
            out
        }
        OutputFormat::Speedscope { pretty } => {
            let stats = load_stats(&args.input)?;
            let metric = args.metric.unwrap_or_else(|| stats.mode().default_metric());
            let name = args
                .input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "austin".to_string());
            let file = export_speedscope(&stats, metric, &name)
                .context("Failed to export Speedscope profile")?;
            speedscope_to_vec(&file, pretty)?
        }
        OutputFormat::Pprof { gzip } => {
            let stats = load_stats(&args.input)?;
            let options = PprofOptions {
                time_nanos: Utc::now().timestamp_nanos_opt(),
                duration_nanos: stats
                    .get_metadata("duration")
                    .and_then(|d| d.trim().parse::<i64>().ok())
                    .and_then(|us| us.checked_mul(1000)),
            };
            let profile = export_pprof(&stats, &options).context("Failed to export pprof profile")?;
            encode_pprof(&profile, gzip)?
        }
    };

    info!("Step 2/2: Writing output...");
    write_output(&args.output, &bytes)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    info!("✓ Output written to: {}", args.output.display());
    info!("Conversion completed in {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}

/// Decode an input file into metadata and samples, skipping invalid records
pub(crate) fn read_samples(path: &Path) -> Result<(Mode, Vec<(String, String)>, Vec<Sample>)> {
    let mut metadata: Vec<(String, String)> = Vec::new();
    let mut samples = Vec::new();
    let mut errors = 0u64;

    let detected = decode_file(path, |decoded| {
        match decoded {
            Ok(AustinEvent::Metadata { name, value }) => metadata.push((name, value)),
            Ok(AustinEvent::Sample(sample)) => samples.push(sample),
            Err(err) => {
                debug!("Skipping {}", err);
                errors += 1;
            }
        }
        Ok(())
    })?;

    if errors > 0 {
        warn!("Skipped {} invalid records", errors);
    }

    let mode = metadata
        .iter()
        .find(|(name, _)| name == "mode")
        .and_then(|(_, value)| value.parse::<Mode>().ok())
        .or(detected)
        .unwrap_or_default();

    Ok((mode, metadata, samples))
}

fn render_compressed(args: &ConvertArgs, counts: bool) -> Result<Vec<u8>> {
    let (mode, metadata, samples) = read_samples(&args.input)?;

    let mut compressor = if counts {
        Compressor::counting()
    } else {
        Compressor::new()
    };
    for sample in &samples {
        compressor
            .add_sample(sample)
            .context("Failed to compress samples")?;
    }
    debug!(
        "Compressed {} samples into {} stacks",
        samples.len(),
        compressor.len()
    );

    // counts are written as plain wall values
    let mode = if counts { Mode::Wall } else { mode };

    let mut out = Vec::new();
    compressor.write_collapsed(mode, &metadata, &mut out)?;
    Ok(out)
}

fn render_samples(args: &ConvertArgs) -> Result<Vec<u8>> {
    let (mode, metadata, samples) = read_samples(&args.input)?;

    let mut out = Vec::new();
    writeln!(out, "# mode: {}", mode)?;
    for (name, value) in metadata.iter().filter(|(name, _)| name != "mode") {
        writeln!(out, "# {}: {}", name, value)?;
    }
    writeln!(out)?;
    for sample in &samples {
        writeln!(out, "{}", format_sample(sample, mode))?;
    }

    Ok(out)
}

/// Validate conversion arguments
///
/// **Public** - can be called before execute_convert for early validation
pub fn validate_args(args: &ConvertArgs) -> Result<()> {
    if args.input.as_os_str().is_empty() {
        anyhow::bail!("Input path cannot be empty");
    }

    if !args.input.is_file() {
        anyhow::bail!("Input file does not exist: {}", args.input.display());
    }

    if args.output.as_os_str().is_empty() {
        anyhow::bail!("Output path cannot be empty");
    }

    if args.input == args.output {
        anyhow::bail!("Output would overwrite the input file");
    }

    if args.metric.is_some() && !matches!(args.format, OutputFormat::Speedscope { .. }) {
        anyhow::bail!("--metric only applies to Speedscope output");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MetricKind;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn args(input: PathBuf, format: OutputFormat) -> ConvertArgs {
        ConvertArgs {
            input,
            output: PathBuf::from("out.txt"),
            format,
            metric: None,
        }
    }

    #[test]
    fn test_validate_args_valid() {
        let input = NamedTempFile::new().unwrap();
        let args = args(input.path().to_path_buf(), OutputFormat::Pprof { gzip: true });
        assert!(validate_args(&args).is_ok());
    }

    #[test]
    fn test_validate_args_missing_input() {
        let args = args(PathBuf::from("/no/such/file"), OutputFormat::Pprof { gzip: true });
        assert!(validate_args(&args).is_err());
    }

    #[test]
    fn test_validate_args_same_paths() {
        let input = NamedTempFile::new().unwrap();
        let mut args = args(input.path().to_path_buf(), OutputFormat::Pprof { gzip: true });
        args.output = args.input.clone();
        assert!(validate_args(&args).is_err());
    }

    #[test]
    fn test_validate_args_metric_needs_speedscope() {
        let input = NamedTempFile::new().unwrap();
        let mut args = args(
            input.path().to_path_buf(),
            OutputFormat::Compressed { counts: false },
        );
        args.metric = Some(MetricKind::Wall);
        assert!(validate_args(&args).is_err());

        args.format = OutputFormat::Speedscope { pretty: false };
        assert!(validate_args(&args).is_ok());
    }
}
