//! Exporters and output writers.
//!
//! This module handles:
//! - Speedscope JSON documents
//! - pprof protobuf profiles (gzipped)
//! - Collapsed stack dumps of a call tree
//! - Writing rendered output to disk

pub mod collapsed;
pub mod file;
pub mod pprof;
pub mod proto;
pub mod speedscope;

// Re-export main functions
pub use collapsed::dump_collapsed;
pub use file::write_output;
pub use pprof::{decode_pprof, encode_pprof, export_pprof, PprofOptions};
pub use speedscope::{export_speedscope, speedscope_to_vec, SpeedscopeFile};
