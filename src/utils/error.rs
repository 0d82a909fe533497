//! Error types for the entire application.
//!
//! We use `thiserror` for library-style errors with custom types,
//! and `anyhow` for application-level error propagation in main.rs and commands.
//!
//! Recoverable conditions (`InvalidSample`) are counted and skipped by the
//! callers. Everything else aborts the current operation.

use thiserror::Error;

/// A single record could not be turned into a sample.
///
/// This is recoverable: callers skip the record and count it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid sample{}: {reason}", line_suffix(.line))]
pub struct InvalidSample {
    /// What was wrong with the record
    pub reason: String,

    /// Line number in the source stream (text format only)
    pub line: Option<usize>,
}

impl InvalidSample {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            line: None,
        }
    }

    /// Attach the line number the record came from
    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" at line {}", l)).unwrap_or_default()
}

/// The binary stream cannot be interpreted any further.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("MOJO stream corruption at byte offset {offset}: {reason}")]
pub struct StreamCorruption {
    /// Absolute byte offset of the offending record
    pub offset: u64,

    pub reason: String,
}

/// A 64-bit metric counter would have wrapped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Metric arithmetic overflow on {field}")]
pub struct MetricOverflow {
    pub field: &'static str,
}

/// Errors that can occur while decoding raw records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error(transparent)]
    Corruption(#[from] StreamCorruption),

    #[error(transparent)]
    Invalid(#[from] InvalidSample),
}

/// Errors that can occur while updating the statistics tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error(transparent)]
    Invalid(#[from] InvalidSample),

    #[error(transparent)]
    Overflow(#[from] MetricOverflow),
}

/// Errors that can occur during export to a third-party format
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Metric '{metric}' is not collected in {mode} mode")]
    UnsupportedMetric { metric: String, mode: String },

    #[error("Frame '{frame}' has no value for declared metric '{metric}'")]
    MissingMetric { metric: String, frame: String },

    #[error("Negative value {value} for metric '{metric}'")]
    NegativeValue { metric: String, value: i64 },

    #[error("Value {value} for metric '{metric}' does not fit the target format")]
    ValueOutOfRange { metric: String, value: u64 },

    #[error("Failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during file output
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write file: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("Invalid output path: {0}")]
    InvalidPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sample_display() {
        let err = InvalidSample::new("no metrics");
        assert_eq!(err.to_string(), "Invalid sample: no metrics");

        let err = err.at_line(12);
        assert_eq!(err.to_string(), "Invalid sample at line 12: no metrics");
    }

    #[test]
    fn test_stream_corruption_display() {
        let err = StreamCorruption {
            offset: 42,
            reason: "undefined string 7".to_string(),
        };
        assert!(err.to_string().contains("offset 42"));
    }
}
