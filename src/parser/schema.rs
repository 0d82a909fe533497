//! Sample model shared by the codecs, the aggregator and the exporters.
//!
//! Frames are ordered root (outermost call) first, leaf (innermost) last
//! everywhere in this crate.

use crate::utils::config::{INVALID_FRAME, KERNEL_FILE, MEMORY_UNIT, TIME_UNIT, UNKNOWN_LINE};
use crate::utils::error::{InvalidSample, MetricOverflow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Profiling mode announced by the `mode` metadata entry of a stream.
///
/// The mode fixes which metrics a sample carries and how the metric
/// field of a collapsed line is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Cpu,
    #[default]
    Wall,
    Memory,
    Full,
}

impl Mode {
    /// Metrics collected in this mode, in pprof sample-type order
    pub fn metrics(self) -> &'static [MetricKind] {
        match self {
            Mode::Cpu => &[MetricKind::Cpu],
            Mode::Wall => &[MetricKind::Wall],
            Mode::Memory => &[MetricKind::MemoryAlloc, MetricKind::MemoryDealloc],
            Mode::Full => &[
                MetricKind::Cpu,
                MetricKind::Wall,
                MetricKind::MemoryAlloc,
                MetricKind::MemoryDealloc,
            ],
        }
    }

    pub fn supports(self, kind: MetricKind) -> bool {
        self.metrics().contains(&kind)
    }

    /// Metric shown when the caller does not pick one
    pub fn default_metric(self) -> MetricKind {
        self.metrics()[0]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Cpu => "cpu",
            Mode::Wall => "wall",
            Mode::Memory => "memory",
            Mode::Full => "full",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = InvalidSample;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cpu" => Ok(Mode::Cpu),
            "wall" => Ok(Mode::Wall),
            "memory" => Ok(Mode::Memory),
            "full" => Ok(Mode::Full),
            other => Err(InvalidSample::new(format!("unknown mode '{}'", other))),
        }
    }
}

/// One projection of a [`Metric`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Wall,
    MemoryAlloc,
    MemoryDealloc,
}

impl MetricKind {
    pub fn is_memory(self) -> bool {
        matches!(self, MetricKind::MemoryAlloc | MetricKind::MemoryDealloc)
    }

    pub fn unit(self) -> &'static str {
        if self.is_memory() {
            MEMORY_UNIT
        } else {
            TIME_UNIT
        }
    }

    /// Human readable label, used in profile names
    pub fn label(self) -> &'static str {
        match self {
            MetricKind::Cpu => "CPU time",
            MetricKind::Wall => "Wall time",
            MetricKind::MemoryAlloc => "Memory allocation",
            MetricKind::MemoryDealloc => "Memory deallocation",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Wall => "wall",
            MetricKind::MemoryAlloc => "memory_alloc",
            MetricKind::MemoryDealloc => "memory_dealloc",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(MetricKind::Cpu),
            "wall" => Ok(MetricKind::Wall),
            "memory_alloc" | "alloc" | "m+" => Ok(MetricKind::MemoryAlloc),
            "memory_dealloc" | "dealloc" | "m-" => Ok(MetricKind::MemoryDealloc),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

/// Measurements attached to a sample or accumulated on a tree node.
///
/// Optional fields are `None` when the sampler does not collect them.
/// Adding two metrics treats a missing operand as zero, and the result
/// is `None` only when both operands are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Metric {
    /// Wall time in microseconds, idle time included
    pub wall: u64,

    /// CPU time in microseconds, idle time excluded
    pub cpu: Option<u64>,

    /// Bytes allocated
    pub memory_alloc: Option<i64>,

    /// Bytes released
    pub memory_dealloc: Option<i64>,

    /// Set when any contributing sample was idle
    pub idle: bool,
}

fn add_opt<T>(
    a: Option<T>,
    b: Option<T>,
    field: &'static str,
    op: fn(T, T) -> Option<T>,
    zero: T,
) -> Result<Option<T>, MetricOverflow>
where
    T: Copy,
{
    match (a, b) {
        (None, None) => Ok(None),
        (a, b) => op(a.unwrap_or(zero), b.unwrap_or(zero))
            .map(Some)
            .ok_or(MetricOverflow { field }),
    }
}

impl Metric {
    /// Plain wall time metric
    pub fn wall(time: u64) -> Self {
        Self {
            wall: time,
            ..Self::default()
        }
    }

    /// One occurrence, used when counting samples instead of measuring them
    pub fn count() -> Self {
        Self::wall(1)
    }

    /// Build a metric from the raw values reported by the sampler.
    ///
    /// `time` is required in every mode but `memory`, and `memory` is
    /// required in `memory` and `full` mode.
    pub fn from_raw(
        mode: Mode,
        time: Option<u64>,
        idle: bool,
        memory: Option<i64>,
    ) -> Result<Self, InvalidSample> {
        let need_time = || time.ok_or_else(|| InvalidSample::new("missing time metric"));
        let need_memory = || memory.ok_or_else(|| InvalidSample::new("missing memory metric"));

        let metric = match mode {
            Mode::Wall => Self {
                idle,
                ..Self::wall(need_time()?)
            },
            Mode::Cpu => {
                let t = need_time()?;
                Self {
                    wall: t,
                    cpu: Some(if idle { 0 } else { t }),
                    idle,
                    ..Self::default()
                }
            }
            Mode::Memory => {
                let m = need_memory()?;
                Self {
                    memory_alloc: Some(m.max(0)),
                    memory_dealloc: Some(m.checked_neg().unwrap_or(i64::MAX).max(0)),
                    idle,
                    ..Self::default()
                }
            }
            Mode::Full => {
                let t = need_time()?;
                let m = need_memory()?;
                Self {
                    wall: t,
                    cpu: Some(if idle { 0 } else { t }),
                    memory_alloc: Some(m.max(0)),
                    memory_dealloc: Some(m.checked_neg().unwrap_or(i64::MAX).max(0)),
                    idle,
                }
            }
        };

        Ok(metric)
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self, MetricOverflow> {
        Ok(Self {
            wall: self
                .wall
                .checked_add(other.wall)
                .ok_or(MetricOverflow { field: "wall" })?,
            cpu: add_opt(self.cpu, other.cpu, "cpu", u64::checked_add, 0)?,
            memory_alloc: add_opt(
                self.memory_alloc,
                other.memory_alloc,
                "memory_alloc",
                i64::checked_add,
                0,
            )?,
            memory_dealloc: add_opt(
                self.memory_dealloc,
                other.memory_dealloc,
                "memory_dealloc",
                i64::checked_add,
                0,
            )?,
            idle: self.idle || other.idle,
        })
    }

    /// Raw metric subtraction, `self - other`.
    ///
    /// Time fields must not go below zero. The idle flag is kept from `self`.
    pub fn checked_sub(&self, other: &Self) -> Result<Self, MetricOverflow> {
        Ok(Self {
            wall: self
                .wall
                .checked_sub(other.wall)
                .ok_or(MetricOverflow { field: "wall" })?,
            cpu: add_opt(self.cpu, other.cpu, "cpu", u64::checked_sub, 0)?,
            memory_alloc: add_opt(
                self.memory_alloc,
                other.memory_alloc,
                "memory_alloc",
                i64::checked_sub,
                0,
            )?,
            memory_dealloc: add_opt(
                self.memory_dealloc,
                other.memory_dealloc,
                "memory_dealloc",
                i64::checked_sub,
                0,
            )?,
            idle: self.idle,
        })
    }

    /// In-place addition; `self` is untouched on overflow
    pub fn accumulate(&mut self, other: &Self) -> Result<(), MetricOverflow> {
        *self = self.checked_add(other)?;
        Ok(())
    }

    /// Project one metric kind. `None` when the field is not collected.
    pub fn value(&self, kind: MetricKind) -> Option<i128> {
        match kind {
            MetricKind::Wall => Some(self.wall as i128),
            MetricKind::Cpu => self.cpu.map(|v| v as i128),
            MetricKind::MemoryAlloc => self.memory_alloc.map(|v| v as i128),
            MetricKind::MemoryDealloc => self.memory_dealloc.map(|v| v as i128),
        }
    }

    /// True when no collected field carries any mass
    pub fn is_zero(&self) -> bool {
        self.wall == 0
            && self.cpu.unwrap_or(0) == 0
            && self.memory_alloc.unwrap_or(0) == 0
            && self.memory_dealloc.unwrap_or(0) == 0
    }

    /// Net memory delta as reported by the sampler (alloc minus dealloc)
    pub fn net_memory(&self) -> i64 {
        self.memory_alloc
            .unwrap_or(0)
            .saturating_sub(self.memory_dealloc.unwrap_or(0))
    }
}

/// A call site: function (scope) name, source file and line.
///
/// Identity is the full triple. Frames are interned by the
/// [`FrameTable`](super::frame::FrameTable) into [`FrameId`](super::frame::FrameId)s.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl Frame {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
        }
    }

    /// Frame the sampler could not read
    pub fn invalid() -> Self {
        Self::new(INVALID_FRAME, "", UNKNOWN_LINE)
    }

    /// Native kernel frame
    pub fn kernel(name: impl Into<String>) -> Self {
        Self::new(name, KERNEL_FILE, UNKNOWN_LINE)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.function, self.line)
    }
}

/// One observation of one thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub pid: u32,

    /// Sub-interpreter or child id; `None` for the main process
    pub child: Option<u32>,

    /// Thread label as reported by the sampler
    pub thread: String,

    /// Root first, leaf last
    pub frames: Vec<Frame>,

    pub metric: Metric,

    /// Garbage collector was running
    pub gc: bool,
}

impl Sample {
    pub fn new(pid: u32, thread: impl Into<String>, frames: Vec<Frame>, metric: Metric) -> Self {
        Self {
            pid,
            child: None,
            thread: thread.into(),
            frames,
            metric,
            gc: false,
        }
    }

    /// Set the child id, mapping `0` to the main process
    pub fn with_child(mut self, child: Option<u32>) -> Self {
        self.child = child.filter(|c| *c != 0);
        self
    }
}

/// Item produced by the codecs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AustinEvent {
    /// `name: value` header or footer entry
    Metadata { name: String, value: String },

    Sample(Sample),
}

/// A decoded record: an event, or a record that was skipped
pub type Decoded = Result<AustinEvent, InvalidSample>;
