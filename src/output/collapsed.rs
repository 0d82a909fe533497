//! Collapsed stack dump of a call tree.
//!
//! Writes the own metric of every node that has one, so that reading the
//! dump back and aggregating it reproduces the same tree totals. A node
//! whose own metric mixes idle and busy time, or allocations and
//! deallocations, takes one line per part.

use crate::aggregator::stats::AustinStats;
use crate::parser::collapsed::{format_frame, format_head, format_metric_lines};
use crate::utils::error::ExportError;
use std::io::Write;

/// Write the tree as a collapsed stack stream with a metadata header
pub fn dump_collapsed<W: Write>(stats: &AustinStats, writer: &mut W) -> Result<(), ExportError> {
    let mode = stats.mode();

    writeln!(writer, "# mode: {}", mode)?;
    for (name, value) in stats.metadata().iter().filter(|(name, _)| name != "mode") {
        writeln!(writer, "# {}: {}", name, value)?;
    }
    writeln!(writer)?;

    for path in stats.own_paths() {
        let mut line = format_head(path.process.pid(), path.process.child(), path.thread.label());
        for id in &path.frames {
            if let Some(frame) = stats.frames().resolve(*id) {
                line.push(';');
                line.push_str(&format_frame(frame));
            }
        }
        for metric in format_metric_lines(&path.own, mode) {
            writeln!(writer, "{} {}", line, metric)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::schema::{Frame, Metric, Mode, Sample};

    #[test]
    fn test_dump_own_lines() {
        let mut stats = AustinStats::new(Mode::Wall);
        let f = |n: &str| Frame::new(n, "m.py", 2);
        stats
            .update(&Sample::new(3, "0x1", vec![f("a"), f("b")], Metric::wall(5)))
            .unwrap();
        stats
            .update(&Sample::new(3, "0x1", vec![f("a")], Metric::wall(2)))
            .unwrap();

        let mut out = Vec::new();
        dump_collapsed(&stats, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# mode: wall\n\nP3;T0x1;m.py:a:2 2\nP3;T0x1;m.py:a:2;m.py:b:2 5\n"
        );
    }

    #[test]
    fn test_dump_splits_mixed_own_metric() {
        let mut stats = AustinStats::new(Mode::Full);
        let frames = vec![Frame::new("f", "a.py", 1)];
        for (t, idle, m) in [(100, false, 64), (40, true, -16)] {
            let metric = Metric::from_raw(Mode::Full, Some(t), idle, Some(m)).unwrap();
            stats.update(&Sample::new(1, "t", frames.clone(), metric)).unwrap();
        }

        let mut out = Vec::new();
        dump_collapsed(&stats, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# mode: full\n\nP1;Tt;a.py:f:1 100,0,64\nP1;Tt;a.py:f:1 40,1,-16\n"
        );
    }
}
