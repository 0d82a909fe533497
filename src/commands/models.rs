use crate::parser::schema::MetricKind;
use crate::utils::config::DEFAULT_TOP_STACKS;
use std::path::PathBuf;

/// Arguments for the summary command
///
/// **Public** - used by main.rs to construct from CLI args
#[derive(Debug, Clone)]
pub struct SummaryArgs {
    /// Austin output, collapsed text or MOJO
    pub input: PathBuf,

    /// Metric to rank stacks by (defaults to the mode's first metric)
    pub metric: Option<MetricKind>,

    /// Number of hot stacks to show
    pub top: usize,

    /// Print the summary as JSON
    pub json: bool,
}

impl Default for SummaryArgs {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            metric: None,
            top: DEFAULT_TOP_STACKS,
            json: false,
        }
    }
}

/// Target of a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Deduplicated collapsed stacks
    Compressed { counts: bool },

    /// Speedscope JSON
    Speedscope { pretty: bool },

    /// pprof protobuf
    Pprof { gzip: bool },

    /// Collapsed stacks, one line per sample or per tree node
    Collapsed { aggregate: bool },
}

/// Arguments for the diff command
///
/// **Public** - used by main.rs to construct from CLI args
#[derive(Debug, Clone)]
pub struct DiffArgs {
    /// Run to report
    pub input: PathBuf,

    /// Run subtracted from `input`
    pub baseline: PathBuf,

    pub output: PathBuf,
}

/// Arguments for the conversion commands
///
/// **Public** - used by main.rs to construct from CLI args
#[derive(Debug, Clone)]
pub struct ConvertArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: OutputFormat,

    /// Metric for single-metric formats (Speedscope)
    pub metric: Option<MetricKind>,
}
