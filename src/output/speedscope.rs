//! Speedscope exporter.
//!
//! Writes the evented flavour of the Speedscope file format: one profile per
//! (process, thread), each a list of open/close events laid out by a depth
//! first walk of the call tree. Frames are listed once in `shared.frames`
//! and referenced by index.

use crate::aggregator::stats::{AustinStats, FrameStats, ProcessStats, ThreadStats};
use crate::parser::frame::FrameId;
use crate::parser::schema::{Metric, MetricKind};
use crate::utils::config::{EXPORTER_NAME, SPEEDSCOPE_SCHEMA, UNKNOWN_LINE};
use crate::utils::error::ExportError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level Speedscope document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedscopeFile {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub shared: Shared,
    pub profiles: Vec<EventedProfile>,
    pub name: String,
    #[serde(rename = "activeProfileIndex")]
    pub active_profile_index: usize,
    pub exporter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shared {
    pub frames: Vec<SpeedscopeFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedscopeFrame {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventedProfile {
    /// Always "evented"
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub unit: String,
    #[serde(rename = "startValue")]
    pub start_value: u64,
    #[serde(rename = "endValue")]
    pub end_value: u64,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "O")]
    Open,
    #[serde(rename = "C")]
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Index into `shared.frames`
    pub frame: usize,
    pub at: u64,
}

struct Builder<'a> {
    stats: &'a AustinStats,
    metric: MetricKind,
    frames: Vec<SpeedscopeFrame>,
    index: HashMap<FrameId, usize>,
}

impl<'a> Builder<'a> {
    fn describe(&self, frame: Option<FrameId>) -> String {
        frame
            .and_then(|id| self.stats.frames().resolve(id))
            .map(|f| f.to_string())
            .unwrap_or_else(|| "<thread>".to_string())
    }

    fn value(&self, metric: &Metric, frame: Option<FrameId>) -> Result<u64, ExportError> {
        let name = self.metric.as_str().to_string();
        let value = metric.value(self.metric).ok_or_else(|| ExportError::MissingMetric {
            metric: name.clone(),
            frame: self.describe(frame),
        })?;

        if value < 0 {
            return Err(ExportError::NegativeValue {
                metric: name,
                value: i64::try_from(value).unwrap_or(i64::MIN),
            });
        }
        u64::try_from(value).map_err(|_| ExportError::ValueOutOfRange {
            metric: name,
            value: u64::MAX,
        })
    }

    fn frame_index(&mut self, id: FrameId) -> usize {
        if let Some(i) = self.index.get(&id) {
            return *i;
        }

        let frame = match self.stats.frames().resolve(id) {
            Some(f) => SpeedscopeFrame {
                name: f.function.clone(),
                file: Some(f.file.clone()),
                line: Some(f.line).filter(|l| *l != UNKNOWN_LINE),
            },
            None => SpeedscopeFrame {
                name: format!("<frame {}>", id.index()),
                file: None,
                line: None,
            },
        };
        self.frames.push(frame);
        self.index.insert(id, self.frames.len() - 1);
        self.frames.len() - 1
    }

    fn out_of_range(&self, at: u64) -> ExportError {
        ExportError::ValueOutOfRange {
            metric: self.metric.as_str().to_string(),
            value: at,
        }
    }

    /// Emit the events of `node` starting at `at`. Returns the node's span.
    fn emit(&mut self, node: &FrameStats, at: u64, events: &mut Vec<Event>) -> Result<u64, ExportError> {
        let total = self.value(&node.total, Some(node.frame()))?;
        if total == 0 {
            return Ok(0);
        }
        let end = at.checked_add(total).ok_or_else(|| self.out_of_range(at))?;

        let frame = self.frame_index(node.frame());
        events.push(Event {
            kind: EventType::Open,
            frame,
            at,
        });

        // children first, own time fills the tail of the span
        let mut cursor = at;
        for child in node.children() {
            let span = self.emit(child, cursor, events)?;
            cursor = cursor.checked_add(span).ok_or_else(|| self.out_of_range(cursor))?;
        }

        events.push(Event {
            kind: EventType::Close,
            frame,
            at: end,
        });

        Ok(total)
    }

    fn profile(&mut self, process: &ProcessStats, thread: &ThreadStats) -> Result<EventedProfile, ExportError> {
        let end_value = self.value(&thread.total, None)?;

        let mut events = Vec::new();
        let mut cursor = 0u64;
        for node in thread.children() {
            let span = self.emit(node, cursor, &mut events)?;
            cursor = cursor.checked_add(span).ok_or_else(|| self.out_of_range(cursor))?;
        }

        Ok(EventedProfile {
            kind: "evented".to_string(),
            name: format!(
                "{} profile for {}:{}",
                self.metric.label(),
                process.name(),
                thread.label()
            ),
            unit: self.metric.unit().to_string(),
            start_value: 0,
            end_value,
            events,
        })
    }
}

/// Export the call tree to a Speedscope document
///
/// **Public** - main entry point for Speedscope output
///
/// # Arguments
/// * `stats` - Aggregated run
/// * `metric` - Metric the event values are taken from
/// * `name` - Document name shown by Speedscope
///
/// # Errors
/// * `ExportError::UnsupportedMetric` - `metric` is not collected in the run's mode
/// * `ExportError::MissingMetric` - a node has no value for `metric`
/// * `ExportError::NegativeValue` - a node has a negative value
pub fn export_speedscope(
    stats: &AustinStats,
    metric: MetricKind,
    name: &str,
) -> Result<SpeedscopeFile, ExportError> {
    if !stats.mode().supports(metric) {
        return Err(ExportError::UnsupportedMetric {
            metric: metric.to_string(),
            mode: stats.mode().to_string(),
        });
    }

    let mut builder = Builder {
        stats,
        metric,
        frames: Vec::new(),
        index: HashMap::new(),
    };

    let mut profiles = Vec::new();
    for process in stats.all_processes() {
        for thread in process.threads() {
            profiles.push(builder.profile(process, thread)?);
        }
    }

    debug!(
        "Exported {} Speedscope profiles with {} frames",
        profiles.len(),
        builder.frames.len()
    );

    Ok(SpeedscopeFile {
        schema: SPEEDSCOPE_SCHEMA.to_string(),
        shared: Shared {
            frames: builder.frames,
        },
        profiles,
        name: name.to_string(),
        active_profile_index: 0,
        exporter: EXPORTER_NAME.to_string(),
    })
}

/// Serialize a Speedscope document
pub fn speedscope_to_vec(file: &SpeedscopeFile, pretty: bool) -> Result<Vec<u8>, ExportError> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(file)?
    } else {
        serde_json::to_vec(file)?
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::schema::{Frame, Mode, Sample};
    use pretty_assertions::assert_eq;

    fn stats() -> AustinStats {
        let mut stats = AustinStats::new(Mode::Wall);
        let f = |n: &str| Frame::new(n, "t.py", 1);
        for (frames, t) in [
            (vec![f("1"), f("2"), f("3")], 100u64),
            (vec![f("1"), f("2"), f("4")], 50),
            (vec![f("1"), f("5")], 30),
        ] {
            stats.update(&Sample::new(1, "0x1", frames, Metric::wall(t))).unwrap();
        }
        stats
    }

    #[test]
    fn test_events_are_nested() {
        let file = export_speedscope(&stats(), MetricKind::Wall, "test").unwrap();
        assert_eq!(file.profiles.len(), 1);

        let profile = &file.profiles[0];
        assert_eq!(profile.name, "Wall time profile for 1:0x1");
        assert_eq!(profile.unit, "microseconds");
        assert_eq!(profile.end_value, 180);

        let events: Vec<(EventType, &str, u64)> = profile
            .events
            .iter()
            .map(|e| (e.kind, file.shared.frames[e.frame].name.as_str(), e.at))
            .collect();
        assert_eq!(
            events,
            vec![
                (EventType::Open, "1", 0),
                (EventType::Open, "2", 0),
                (EventType::Open, "3", 0),
                (EventType::Close, "3", 100),
                (EventType::Open, "4", 100),
                (EventType::Close, "4", 150),
                (EventType::Close, "2", 150),
                (EventType::Open, "5", 150),
                (EventType::Close, "5", 180),
                (EventType::Close, "1", 180),
            ]
        );
        assert_eq!(file.shared.frames.len(), 5);
    }

    #[test]
    fn test_unsupported_metric() {
        let err = export_speedscope(&stats(), MetricKind::MemoryAlloc, "x").unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedMetric { .. }));
    }

    #[test]
    fn test_json_field_names() {
        let file = export_speedscope(&stats(), MetricKind::Wall, "test").unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&speedscope_to_vec(&file, false).unwrap()).unwrap();

        assert_eq!(json["$schema"], SPEEDSCOPE_SCHEMA);
        assert_eq!(json["activeProfileIndex"], 0);
        assert_eq!(json["profiles"][0]["type"], "evented");
        assert_eq!(json["profiles"][0]["startValue"], 0);
        assert_eq!(json["profiles"][0]["events"][0]["type"], "O");
        assert!(json["exporter"].as_str().unwrap().starts_with("austin-stats"));
    }

    #[test]
    fn test_zero_nodes_are_skipped() {
        let mut stats = AustinStats::new(Mode::Full);
        let idle = Metric::from_raw(Mode::Full, Some(10), true, Some(0)).unwrap();
        stats
            .update(&Sample::new(1, "0x1", vec![Frame::new("sleep", "t.py", 1)], idle))
            .unwrap();

        let file = export_speedscope(&stats, MetricKind::Cpu, "test").unwrap();
        assert!(file.profiles[0].events.is_empty());
        assert_eq!(file.profiles[0].end_value, 0);
    }
}
