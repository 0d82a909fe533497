//! Austin Stats CLI
//!
//! Summaries and format conversions for Austin sampler output.
//! Reads collapsed stack text or MOJO binary files.

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::path::PathBuf;

use austin_stats::commands::{
    execute_convert, execute_diff, execute_summary, validate_args, validate_diff_args,
    ConvertArgs, DiffArgs, OutputFormat, SummaryArgs,
};
use austin_stats::parser::MetricKind;
use austin_stats::utils::config::DEFAULT_TOP_STACKS;

/// Austin Stats - aggregate and export Austin samples
#[derive(Parser, Debug)]
#[command(name = "austin-stats")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Aggregate a run and print its summary
    Summary {
        /// Austin output file (collapsed text or MOJO)
        input: PathBuf,

        /// Metric to rank stacks by (cpu, wall, alloc, dealloc)
        #[arg(short, long)]
        metric: Option<MetricKind>,

        /// Number of hot stacks to show
        #[arg(long, default_value_t = DEFAULT_TOP_STACKS)]
        top: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Deduplicate stacks, summing their metrics
    Compress {
        input: PathBuf,
        output: PathBuf,

        /// Count occurrences instead of summing metrics
        #[arg(long)]
        counts: bool,
    },

    /// Export to the Speedscope JSON format
    Speedscope {
        input: PathBuf,
        output: PathBuf,

        /// Metric for the event values (defaults to the mode's first metric)
        #[arg(short, long)]
        metric: Option<MetricKind>,

        /// Pretty-print the JSON
        #[arg(long)]
        indent: bool,
    },

    /// Export to the pprof protobuf format
    Pprof {
        input: PathBuf,
        output: PathBuf,

        /// Write the raw protobuf instead of gzipping it
        #[arg(long)]
        no_gzip: bool,
    },

    /// Convert to collapsed stack text
    Collapse {
        input: PathBuf,
        output: PathBuf,

        /// Write one line per call tree node instead of one per sample
        #[arg(long)]
        aggregate: bool,
    },

    /// Subtract a baseline run from a run, stack by stack
    Diff {
        input: PathBuf,

        /// Run to subtract
        baseline: PathBuf,

        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    // Execute command
    let (input, output, format, metric) = match cli.command {
        Commands::Summary {
            input,
            metric,
            top,
            json,
        } => {
            return execute_summary(SummaryArgs {
                input,
                metric,
                top,
                json,
            });
        }

        Commands::Compress {
            input,
            output,
            counts,
        } => (input, output, OutputFormat::Compressed { counts }, None),

        Commands::Speedscope {
            input,
            output,
            metric,
            indent,
        } => (input, output, OutputFormat::Speedscope { pretty: indent }, metric),

        Commands::Pprof {
            input,
            output,
            no_gzip,
        } => (input, output, OutputFormat::Pprof { gzip: !no_gzip }, None),

        Commands::Collapse {
            input,
            output,
            aggregate,
        } => (input, output, OutputFormat::Collapsed { aggregate }, None),

        Commands::Diff {
            input,
            baseline,
            output,
        } => {
            let args = DiffArgs {
                input,
                baseline,
                output,
            };
            validate_diff_args(&args)?;
            return execute_diff(args);
        }
    };

    let args = ConvertArgs {
        input,
        output,
        format,
        metric,
    };

    // Validate args first
    validate_args(&args)?;

    execute_convert(args)
}
