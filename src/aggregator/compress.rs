//! Stack deduplication.
//!
//! Folds a sequence of (stack signature, metric) pairs into one row per
//! distinct signature, summing the metrics. Rows come out in the order of
//! the first occurrence of their signature, so identical input yields
//! identical output.
//!
//! Idle and non-idle occurrences of the same stack are kept on separate
//! rows: the text format carries the idle flag per line and merging the two
//! would lose it.
//!
//! Two compressed runs can be diffed row by row with [`Compressor::diff`].

use crate::parser::collapsed::{format_frame, format_head, format_metric_lines};
use crate::parser::schema::{Metric, Mode, Sample};
use crate::utils::error::MetricOverflow;
use log::debug;
use std::collections::HashMap;
use std::io::{self, Write};

/// Structural identity of one call path: process head, thread head, frames
pub fn signature(sample: &Sample) -> Vec<String> {
    let head = format_head(sample.pid, sample.child, &sample.thread);
    // format_head renders "P<pid>;T<thread>", split back into two entries
    let mut sig: Vec<String> = head.splitn(2, ';').map(str::to_string).collect();
    sig.extend(sample.frames.iter().map(format_frame));
    sig
}

/// One output row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub signature: Vec<String>,
    pub metric: Metric,
}

impl Row {
    /// `sig;na;ture metric` lines in the layout of `mode`.
    ///
    /// A row with both allocations and deallocations takes two lines.
    pub fn to_lines(&self, mode: Mode) -> Vec<String> {
        let stack = self.signature.join(";");
        format_metric_lines(&self.metric, mode)
            .into_iter()
            .map(|metric| format!("{} {}", stack, metric))
            .collect()
    }
}

/// Accumulates rows keyed by signature.
///
/// **Public** - main entry point for compression
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    rows: Vec<Row>,
    index: HashMap<(Vec<String>, bool), usize>,

    /// Count occurrences instead of summing measurements
    counts: bool,
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compressor that counts occurrences: every sample weighs 1
    pub fn counting() -> Self {
        Self {
            counts: true,
            ..Self::default()
        }
    }

    /// Add one occurrence of `signature`.
    ///
    /// # Errors
    /// * `MetricOverflow` - the row sum would wrap; the row is unchanged
    pub fn add(&mut self, signature: Vec<String>, metric: &Metric) -> Result<(), MetricOverflow> {
        let metric = if self.counts { Metric::count() } else { *metric };
        let key = (signature, metric.idle);

        match self.index.get(&key) {
            Some(i) => self.rows[*i].metric.accumulate(&metric),
            None => {
                self.rows.push(Row {
                    signature: key.0.clone(),
                    metric,
                });
                self.index.insert(key, self.rows.len() - 1);
                Ok(())
            }
        }
    }

    pub fn add_sample(&mut self, sample: &Sample) -> Result<(), MetricOverflow> {
        self.add(signature(sample), &sample.metric)
    }

    /// Rows in first-seen order
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sum over all rows
    pub fn total(&self) -> Result<Metric, MetricOverflow> {
        self.rows
            .iter()
            .try_fold(Metric::default(), |acc, row| acc.checked_add(&row.metric))
    }

    /// Raw metric difference `self - baseline`, row by row.
    ///
    /// Rows are matched on signature and idle flag. A matched row keeps the
    /// time that `self` spent over `baseline`; rows where the baseline took
    /// longer (wall or CPU) are dropped. Rows missing from the baseline are
    /// kept whole and rows only in the baseline are not reported.
    ///
    /// Memory deltas may be negative: a drop in allocations is reported as
    /// deallocation, so both memory fields stay non-negative and the net
    /// change is preserved.
    ///
    /// # Errors
    /// * `MetricOverflow` - a memory delta does not fit
    pub fn diff(&self, baseline: &Compressor) -> Result<Compressor, MetricOverflow> {
        let mut delta = Compressor {
            counts: self.counts,
            ..Self::default()
        };

        for row in &self.rows {
            let key = (row.signature.clone(), row.metric.idle);
            let metric = match baseline.index.get(&key).map(|i| &baseline.rows[*i].metric) {
                None => row.metric,
                Some(base)
                    if base.wall > row.metric.wall
                        || base.cpu.unwrap_or(0) > row.metric.cpu.unwrap_or(0) =>
                {
                    debug!("Dropping {} from the diff", row.signature.join(";"));
                    continue;
                }
                Some(base) => rebalance(row.metric.checked_sub(base)?)?,
            };

            delta.rows.push(Row {
                signature: row.signature.clone(),
                metric,
            });
            delta.index.insert(key, delta.rows.len() - 1);
        }

        debug!("Diff kept {} of {} stacks", delta.len(), self.len());
        Ok(delta)
    }

    /// Write the rows as a collapsed stack stream.
    ///
    /// Metadata entries are written first as `# key: value` lines. A `mode`
    /// entry is always present and reflects `mode`.
    pub fn write_collapsed<W: Write>(
        &self,
        mode: Mode,
        metadata: &[(String, String)],
        writer: &mut W,
    ) -> io::Result<()> {
        writeln!(writer, "# mode: {}", mode)?;
        for (name, value) in metadata.iter().filter(|(name, _)| name != "mode") {
            writeln!(writer, "# {}: {}", name, value)?;
        }
        writeln!(writer)?;

        for row in &self.rows {
            for line in row.to_lines(mode) {
                writeln!(writer, "{}", line)?;
            }
        }

        debug!("Wrote {} compressed stacks", self.rows.len());
        Ok(())
    }
}

/// Move negative memory fields to the opposite side
fn rebalance(metric: Metric) -> Result<Metric, MetricOverflow> {
    if metric.memory_alloc.is_none() && metric.memory_dealloc.is_none() {
        return Ok(metric);
    }
    let alloc = i128::from(metric.memory_alloc.unwrap_or(0));
    let dealloc = i128::from(metric.memory_dealloc.unwrap_or(0));

    let side = |n: i128, field: &'static str| i64::try_from(n).map_err(|_| MetricOverflow { field });
    Ok(Metric {
        memory_alloc: Some(side(alloc.max(0) + (-dealloc).max(0), "memory_alloc")?),
        memory_dealloc: Some(side(dealloc.max(0) + (-alloc).max(0), "memory_dealloc")?),
        ..metric
    })
}

/// Compress a sequence of (signature, metric) pairs
pub fn compress<I>(records: I) -> Result<Compressor, MetricOverflow>
where
    I: IntoIterator<Item = (Vec<String>, Metric)>,
{
    let mut compressor = Compressor::new();
    for (signature, metric) in records {
        compressor.add(signature, &metric)?;
    }
    Ok(compressor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::schema::Frame;
    use pretty_assertions::assert_eq;

    fn sig(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rows_are_summed_in_first_seen_order() {
        let compressor = compress(vec![
            (sig(&["P1", "T1", "a"]), Metric::wall(10)),
            (sig(&["P1", "T1", "b"]), Metric::wall(5)),
            (sig(&["P1", "T1", "a"]), Metric::wall(7)),
        ])
        .unwrap();

        assert_eq!(compressor.len(), 2);
        assert_eq!(compressor.rows()[0].signature, sig(&["P1", "T1", "a"]));
        assert_eq!(compressor.rows()[0].metric.wall, 17);
        assert_eq!(compressor.total().unwrap().wall, 22);
    }

    #[test]
    fn test_idle_rows_are_kept_apart() {
        let idle = Metric {
            idle: true,
            ..Metric::wall(3)
        };
        let compressor = compress(vec![
            (sig(&["P1", "T1", "a"]), Metric::wall(1)),
            (sig(&["P1", "T1", "a"]), idle),
        ])
        .unwrap();
        assert_eq!(compressor.len(), 2);
    }

    #[test]
    fn test_counting() {
        let mut compressor = Compressor::counting();
        let s = Sample::new(1, "0x1", vec![Frame::new("f", "a.py", 3)], Metric::wall(99));
        compressor.add_sample(&s).unwrap();
        compressor.add_sample(&s).unwrap();
        assert_eq!(compressor.rows()[0].metric.wall, 2);
    }

    #[test]
    fn test_signature() {
        let s = Sample::new(4, "0x1", vec![Frame::new("f", "a.py", 3)], Metric::wall(1))
            .with_child(Some(2));
        assert_eq!(signature(&s), sig(&["P4", "T2:0x1", "a.py:f:3"]));
    }

    #[test]
    fn test_write_collapsed() {
        let compressor = compress(vec![(sig(&["P1", "T1", "a.py:f:3"]), Metric::wall(4))]).unwrap();
        let mut out = Vec::new();
        compressor
            .write_collapsed(
                Mode::Wall,
                &[("interval".to_string(), "100".to_string())],
                &mut out,
            )
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# mode: wall\n# interval: 100\n\nP1;T1;a.py:f:3 4\n"
        );
    }

    fn full(wall: u64, cpu: u64, alloc: i64, dealloc: i64) -> Metric {
        Metric {
            wall,
            cpu: Some(cpu),
            memory_alloc: Some(alloc),
            memory_dealloc: Some(dealloc),
            idle: false,
        }
    }

    #[test]
    fn test_diff_subtracts_matching_rows() {
        let run = compress(vec![
            (sig(&["P1", "T1", "a"]), Metric::wall(30)),
            (sig(&["P1", "T1", "b"]), Metric::wall(12)),
        ])
        .unwrap();
        let baseline = compress(vec![(sig(&["P1", "T1", "a"]), Metric::wall(20))]).unwrap();

        let delta = run.diff(&baseline).unwrap();
        assert_eq!(
            delta.rows(),
            &[
                Row {
                    signature: sig(&["P1", "T1", "a"]),
                    metric: Metric::wall(10),
                },
                // missing from the baseline: kept whole
                Row {
                    signature: sig(&["P1", "T1", "b"]),
                    metric: Metric::wall(12),
                },
            ]
        );
    }

    #[test]
    fn test_diff_drops_rows_slower_in_baseline() {
        let run = compress(vec![
            (sig(&["P1", "T1", "a"]), full(10, 4, 0, 0)),
            (sig(&["P1", "T1", "b"]), full(10, 8, 0, 0)),
        ])
        .unwrap();
        let baseline = compress(vec![
            (sig(&["P1", "T1", "a"]), full(15, 2, 0, 0)),
            (sig(&["P1", "T1", "b"]), full(5, 9, 0, 0)),
            (sig(&["P1", "T1", "c"]), full(5, 5, 0, 0)),
        ])
        .unwrap();

        assert!(run.diff(&baseline).unwrap().is_empty());
    }

    #[test]
    fn test_diff_idle_rows_match_only_idle_rows() {
        let idle = Metric {
            idle: true,
            ..Metric::wall(8)
        };
        let run = compress(vec![(sig(&["P1", "T1", "a"]), idle)]).unwrap();
        let baseline = compress(vec![(sig(&["P1", "T1", "a"]), Metric::wall(5))]).unwrap();

        let delta = run.diff(&baseline).unwrap();
        assert_eq!(delta.rows()[0].metric, idle);
    }

    #[test]
    fn test_diff_negative_memory_delta() {
        let run = compress(vec![(sig(&["P1", "T1", "a"]), full(10, 10, 100, 40))]).unwrap();
        let baseline = compress(vec![(sig(&["P1", "T1", "a"]), full(4, 4, 300, 10))]).unwrap();

        let delta = run.diff(&baseline).unwrap();
        let metric = delta.rows()[0].metric;
        assert_eq!(metric, full(6, 6, 0, 230));
        assert_eq!(metric.net_memory(), (100 - 40) - (300 - 10));

        let mut out = Vec::new();
        delta.write_collapsed(Mode::Full, &[], &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("\nP1;T1;a 6,0,-230\n"));
    }
}
