//! Run summary and hot stacks.
//!
//! Hot stacks are the call paths with the largest own metric. These are the
//! first places to look at when reading a profile.

use super::stats::{AustinStats, StackPath};
use crate::parser::collapsed::{format_frame, format_head};
use crate::parser::schema::{Metric, MetricKind, Mode};
use crate::utils::error::MetricOverflow;
use log::debug;
use serde::Serialize;

/// One entry of the hot stack ranking
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HotStack {
    /// Collapsed form of the call path
    pub stack: String,

    /// Own value of the path's last frame, in the unit of the ranked metric
    pub value: i128,

    /// Share of the ranked metric over the whole run
    pub percentage: f64,
}

/// End-of-run summary: what went in, what was rejected, where the time went
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: Mode,
    pub metric: MetricKind,
    pub samples: u64,
    pub errors: u64,
    pub processes: usize,
    pub threads: usize,
    pub total: Metric,
    pub hot_stacks: Vec<HotStack>,
}

impl RunSummary {
    /// Share of records that were rejected, in percent
    pub fn error_rate(&self) -> f64 {
        let seen = self.samples + self.errors;
        if seen == 0 {
            0.0
        } else {
            (self.errors as f64 / seen as f64) * 100.0
        }
    }

    /// Get human-readable summary
    ///
    /// **Public** - for logging and the CLI
    pub fn summary(&self) -> String {
        format!(
            "Mode: {} | Samples: {} | Errors: {} ({:.1}%) | Processes: {} | Threads: {} | Total {}: {} {}",
            self.mode,
            self.samples,
            self.errors,
            self.error_rate(),
            self.processes,
            self.threads,
            self.metric.label(),
            self.total.value(self.metric).unwrap_or(0),
            self.metric.unit(),
        )
    }
}

/// Render a path as a collapsed stack
fn render(stats: &AustinStats, path: &StackPath<'_>) -> String {
    let mut stack = format_head(path.process.pid(), path.process.child(), path.thread.label());
    for id in &path.frames {
        if let Some(frame) = stats.frames().resolve(*id) {
            stack.push(';');
            stack.push_str(&format_frame(frame));
        }
    }
    stack
}

/// Rank the call paths by their own value of `metric`
///
/// **Public** - main entry point for hot stack calculation
///
/// # Arguments
/// * `stats` - Aggregated run
/// * `metric` - Metric to rank by
/// * `top_n` - Number of stacks to return
///
/// # Returns
/// At most `top_n` stacks, largest first. Ties keep tree order.
pub fn calculate_hot_stacks(
    stats: &AustinStats,
    metric: MetricKind,
    top_n: usize,
) -> Result<Vec<HotStack>, MetricOverflow> {
    let total = stats.total()?.value(metric).unwrap_or(0);
    let mut paths: Vec<(i128, StackPath<'_>)> = stats
        .own_paths()
        .into_iter()
        .filter_map(|p| p.own.value(metric).filter(|v| *v != 0).map(|v| (v, p)))
        .collect();

    debug!("Ranking {} stacks by {}", paths.len(), metric);

    // stable sort keeps tree order among equal values
    paths.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(paths
        .iter()
        .take(top_n)
        .map(|(value, path)| HotStack {
            stack: render(stats, path),
            value: *value,
            percentage: if total != 0 {
                (*value as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        })
        .collect())
}

/// Summarize a run
pub fn summarize(
    stats: &AustinStats,
    metric: MetricKind,
    top_n: usize,
) -> Result<RunSummary, MetricOverflow> {
    let processes = stats.all_processes();

    Ok(RunSummary {
        mode: stats.mode(),
        metric,
        samples: stats.samples(),
        errors: stats.errors(),
        processes: processes.len(),
        threads: processes.iter().map(|p| p.threads().len()).sum(),
        total: stats.total()?,
        hot_stacks: calculate_hot_stacks(stats, metric, top_n)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::schema::{Frame, Sample};
    use crate::utils::error::InvalidSample;

    fn stats() -> AustinStats {
        let mut stats = AustinStats::new(Mode::Wall);
        let f = |n: &str| Frame::new(n, "m.py", 1);
        for (frames, t) in [
            (vec![f("main"), f("execute")], 5000u64),
            (vec![f("main"), f("storage")], 3000),
            (vec![f("main"), f("compute")], 2000),
        ] {
            stats.update(&Sample::new(1, "0x1", frames, Metric::wall(t))).unwrap();
        }
        stats
    }

    #[test]
    fn test_calculate_hot_stacks() {
        let hot = calculate_hot_stacks(&stats(), MetricKind::Wall, 2).unwrap();

        assert_eq!(hot.len(), 2);
        assert_eq!(hot[0].stack, "P1;T0x1;m.py:main:1;m.py:execute:1");
        assert_eq!(hot[0].value, 5000);
        assert_eq!(hot[0].percentage, 50.0);
        assert_eq!(hot[1].value, 3000);
    }

    #[test]
    fn test_summary_counts() {
        let mut stats = stats();
        let _ = stats.ingest(Err(InvalidSample::new("bad")));

        let summary = summarize(&stats, MetricKind::Wall, 10).unwrap();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.processes, 1);
        assert_eq!(summary.threads, 1);
        assert_eq!(summary.total.wall, 10000);
        assert_eq!(summary.hot_stacks.len(), 3);
        assert_eq!(summary.error_rate(), 25.0);
        assert!(summary.summary().contains("Errors: 1"));
    }

    #[test]
    fn test_summary_empty() {
        let summary = summarize(&AustinStats::default(), MetricKind::Wall, 10).unwrap();
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.error_rate(), 0.0);
        assert!(summary.hot_stacks.is_empty());
    }
}
