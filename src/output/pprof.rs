//! pprof exporter.
//!
//! Every call tree node with a non-zero own metric becomes one pprof sample
//! whose values are the node's own metric, one per sample type. Summing a
//! sample type column over all samples gives back the run total.
//!
//! Tables:
//! - strings: index 0 is the empty string
//! - functions: one per (name, file)
//! - mappings: one per file
//! - locations: one per interned frame
//!
//! All ids start at 1.

use super::proto::{Function, Label, Line, Location, Mapping, Profile, Sample, ValueType};
use crate::aggregator::stats::{AustinStats, StackPath};
use crate::parser::frame::FrameId;
use crate::parser::schema::{MetricKind, Mode};
use crate::utils::config::{CHILD_LABEL, PROCESS_LABEL, THREAD_LABEL};
use crate::utils::error::ExportError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use prost::Message;
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Options for [`export_pprof`]
#[derive(Debug, Clone, Default)]
pub struct PprofOptions {
    /// Collection time, nanoseconds past the epoch
    pub time_nanos: Option<i64>,

    /// Duration of the run, nanoseconds
    pub duration_nanos: Option<i64>,
}

/// pprof sample type name for a metric
pub fn sample_type_name(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Cpu => "cpu",
        MetricKind::Wall => "wall",
        MetricKind::MemoryAlloc => "alloc_space",
        MetricKind::MemoryDealloc => "dealloc_space",
    }
}

#[derive(Debug)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self {
            strings: Vec::new(),
            index: HashMap::new(),
        };
        table.intern("");
        table
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(i) = self.index.get(s) {
            return *i;
        }
        let i = self.strings.len() as i64;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }
}

struct Builder<'a> {
    stats: &'a AustinStats,
    metrics: &'static [MetricKind],
    strings: StringTable,
    functions: Vec<Function>,
    function_ids: HashMap<(String, String), u64>,
    mappings: Vec<Mapping>,
    mapping_ids: HashMap<String, u64>,
    locations: Vec<Location>,
    location_ids: HashMap<FrameId, u64>,
}

impl<'a> Builder<'a> {
    fn new(stats: &'a AustinStats, mode: Mode) -> Self {
        Self {
            stats,
            metrics: mode.metrics(),
            strings: StringTable::new(),
            functions: Vec::new(),
            function_ids: HashMap::new(),
            mappings: Vec::new(),
            mapping_ids: HashMap::new(),
            locations: Vec::new(),
            location_ids: HashMap::new(),
        }
    }

    fn function_id(&mut self, name: &str, file: &str) -> u64 {
        let key = (name.to_string(), file.to_string());
        if let Some(id) = self.function_ids.get(&key) {
            return *id;
        }

        let id = self.functions.len() as u64 + 1;
        let name = self.strings.intern(name);
        let filename = self.strings.intern(file);
        self.functions.push(Function {
            id,
            name,
            system_name: name,
            filename,
            start_line: 0,
        });
        self.function_ids.insert(key, id);
        id
    }

    fn mapping_id(&mut self, file: &str) -> u64 {
        if let Some(id) = self.mapping_ids.get(file) {
            return *id;
        }

        let id = self.mappings.len() as u64 + 1;
        let filename = self.strings.intern(file);
        self.mappings.push(Mapping {
            id,
            filename,
            has_functions: true,
            has_filenames: true,
            has_line_numbers: true,
            ..Mapping::default()
        });
        self.mapping_ids.insert(file.to_string(), id);
        id
    }

    fn location_id(&mut self, frame: FrameId) -> Result<u64, ExportError> {
        if let Some(id) = self.location_ids.get(&frame) {
            return Ok(*id);
        }

        let stats = self.stats;
        let resolved = stats.frames().resolve(frame).ok_or_else(|| {
            ExportError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame handle {}", frame.index()),
            ))
        })?;

        let function_id = self.function_id(&resolved.function, &resolved.file);
        let mapping_id = self.mapping_id(&resolved.file);
        let id = self.locations.len() as u64 + 1;
        self.locations.push(Location {
            id,
            mapping_id,
            address: 0,
            line: vec![Line {
                function_id,
                line: i64::from(resolved.line),
            }],
            is_folded: false,
        });
        self.location_ids.insert(frame, id);
        Ok(id)
    }

    fn describe(&self, path: &StackPath<'_>) -> String {
        path.frames
            .last()
            .and_then(|id| self.stats.frames().resolve(*id))
            .map(|f| f.to_string())
            .unwrap_or_else(|| format!("<thread {}>", path.thread.label()))
    }

    fn values(&self, path: &StackPath<'_>) -> Result<Vec<i64>, ExportError> {
        self.metrics
            .iter()
            .map(|kind| {
                let metric = kind.as_str().to_string();
                let value = path.own.value(*kind).ok_or_else(|| ExportError::MissingMetric {
                    metric: metric.clone(),
                    frame: self.describe(path),
                })?;
                if value < 0 {
                    return Err(ExportError::NegativeValue {
                        metric,
                        value: i64::try_from(value).unwrap_or(i64::MIN),
                    });
                }
                i64::try_from(value).map_err(|_| ExportError::ValueOutOfRange {
                    metric,
                    value: u64::try_from(value).unwrap_or(u64::MAX),
                })
            })
            .collect()
    }

    fn sample(&mut self, path: &StackPath<'_>) -> Result<Sample, ExportError> {
        let value = self.values(path)?;

        let mut location_id = Vec::with_capacity(path.frames.len());
        for frame in path.frames.iter().rev() {
            location_id.push(self.location_id(*frame)?);
        }

        let mut label = vec![Label {
            key: self.strings.intern(PROCESS_LABEL),
            num: i64::from(path.process.pid()),
            ..Label::default()
        }];
        if let Some(child) = path.process.child() {
            label.push(Label {
                key: self.strings.intern(CHILD_LABEL),
                num: i64::from(child),
                ..Label::default()
            });
        }
        label.push(Label {
            key: self.strings.intern(THREAD_LABEL),
            str: self.strings.intern(path.thread.label()),
            ..Label::default()
        });

        Ok(Sample {
            location_id,
            value,
            label,
        })
    }
}

/// Export the call tree to a pprof profile
///
/// **Public** - main entry point for pprof output
///
/// # Errors
/// * `ExportError::MissingMetric` - a node lacks a metric of the run's mode
/// * `ExportError::NegativeValue` - a node has a negative value
/// * `ExportError::ValueOutOfRange` - a value does not fit a signed 64-bit integer
pub fn export_pprof(stats: &AustinStats, options: &PprofOptions) -> Result<Profile, ExportError> {
    let mode = stats.mode();
    let mut builder = Builder::new(stats, mode);

    let sample_type: Vec<ValueType> = mode
        .metrics()
        .iter()
        .map(|kind| ValueType {
            r#type: builder.strings.intern(sample_type_name(*kind)),
            unit: builder.strings.intern(kind.unit()),
        })
        .collect();

    let mut sample = Vec::new();
    for path in stats.own_paths() {
        sample.push(builder.sample(&path)?);
    }

    debug!(
        "Exported pprof profile: {} samples, {} locations, {} functions",
        sample.len(),
        builder.locations.len(),
        builder.functions.len()
    );

    Ok(Profile {
        sample_type,
        sample,
        mapping: builder.mappings,
        location: builder.locations,
        function: builder.functions,
        string_table: builder.strings.strings,
        time_nanos: options.time_nanos.unwrap_or(0),
        duration_nanos: options.duration_nanos.unwrap_or(0),
        ..Profile::default()
    })
}

/// Serialize a profile, gzipped unless `gzip` is false
pub fn encode_pprof(profile: &Profile, gzip: bool) -> Result<Vec<u8>, ExportError> {
    let raw = profile.encode_to_vec();
    if !gzip {
        return Ok(raw);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Parse a serialized profile, gzipped or not
pub fn decode_pprof(bytes: &[u8]) -> Result<Profile, ExportError> {
    let raw = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut raw = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut raw)?;
        raw
    } else {
        bytes.to_vec()
    };

    Profile::decode(raw.as_slice())
        .map_err(|e| ExportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}
