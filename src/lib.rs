//! Austin Stats
//!
//! Aggregation and export of frame stack samples produced by the
//! Austin sampler.
//!
//! This crate provides:
//! - decoders for the collapsed stack text format and the MOJO binary format
//! - a per-process, per-thread call tree with own/total metrics
//! - stack compression
//! - Speedscope and pprof exporters
//!
//! ## Getting Started
//!
//! ```ignore
//! use austin_stats::aggregator::AustinStats;
//! use austin_stats::parser::{RawRecord, SampleDecoder};
//!
//! let mut stats = AustinStats::default();
//! let mut decoder = SampleDecoder::new();
//! let mut decoded = Vec::new();
//! for line in input.lines() {
//!     decoder.decode(RawRecord::Text(line), &mut decoded)?;
//! }
//! for item in decoded {
//!     let _ = stats.apply(item);
//! }
//! ```
//!
//! The `austin-stats` binary wraps the library for use on files.

pub mod aggregator;
pub mod commands;
pub mod output;
pub mod parser;
pub mod utils;
