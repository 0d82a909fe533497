//! CLI command implementations.
//!
//! Each command is implemented in its own module.
//! Commands orchestrate the various library components to perform user tasks.

pub mod convert;
pub mod diff;
pub mod input;
pub mod models;
pub mod summary;

// Re-export main command functions
pub use convert::{execute_convert, validate_args};
pub use diff::{execute_diff, validate_diff_args};
pub use input::{decode_file, load_stats};
pub use models::{ConvertArgs, DiffArgs, OutputFormat, SummaryArgs};
pub use summary::execute_summary;
