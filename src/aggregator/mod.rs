//! Aggregation of samples into statistics.
//!
//! This module transforms decoded samples into:
//! - A per-process, per-thread call tree with own/total metrics
//! - Deduplicated stacks (compression)
//! - A run summary with the hottest stacks

pub mod compress;
pub mod stats;
pub mod summary;

// Re-export main types and functions
pub use compress::{compress, signature, Compressor, Row};
pub use stats::{AustinStats, Children, FrameStats, ProcessStats, StackPath, ThreadStats};
pub use summary::{calculate_hot_stacks, summarize, HotStack, RunSummary};
