//! Summary command implementation.

use super::input::load_stats;
use super::models::SummaryArgs;
use crate::aggregator::summarize;
use anyhow::{Context, Result};
use log::info;
use std::time::Instant;

/// Execute the summary command
///
/// **Public** - main entry point called from main.rs
pub fn execute_summary(args: SummaryArgs) -> Result<()> {
    let start_time = Instant::now();

    info!("Step 1/2: Aggregating {}...", args.input.display());
    let stats = load_stats(&args.input)?;

    let metric = args.metric.unwrap_or_else(|| stats.mode().default_metric());
    if !stats.mode().supports(metric) {
        anyhow::bail!("Metric '{}' is not collected in {} mode", metric, stats.mode());
    }

    info!("Step 2/2: Ranking stacks by {}...", metric);
    let summary = summarize(&stats, metric, args.top).context("Failed to summarize run")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
        );
    } else {
        println!("\n{}", "=".repeat(80));
        println!("RUN SUMMARY");
        println!("{}", "=".repeat(80));
        for (name, value) in stats.metadata() {
            println!("{:<16} {}", format!("{}:", name), value);
        }
        println!("{}", summary.summary());
        println!("\nTop {} stacks by {}:", summary.hot_stacks.len(), metric.label());
        for (i, stack) in summary.hot_stacks.iter().enumerate() {
            println!(
                "{:>3}. {:>12} {} ({:.1}%)  {}",
                i + 1,
                stack.value,
                metric.unit(),
                stack.percentage,
                stack.stack
            );
        }
        println!("{}", "=".repeat(80));
    }

    info!("Summary completed in {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}
