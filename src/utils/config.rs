//! Configuration and constants for the library and CLI.

/// Magic bytes opening every MOJO stream
pub const MOJO_MAGIC: &[u8; 3] = b"MOJ";

/// Highest MOJO version whose layout we know.
/// Newer streams are decoded with this layout.
pub const MOJO_MAX_VERSION: u64 = 3;

/// Implicit string table entries, present in every process
pub const MOJO_EMPTY_STRING: (u64, &str) = (0, "");
pub const MOJO_UNKNOWN_STRING: (u64, &str) = (1, "<unknown>");

// Speedscope file format
pub const SPEEDSCOPE_SCHEMA: &str = "https://www.speedscope.app/file-format-schema.json";
pub const EXPORTER_NAME: &str = concat!("austin-stats ", env!("CARGO_PKG_VERSION"));

// Units shared by the exporters
pub const TIME_UNIT: &str = "microseconds";
pub const MEMORY_UNIT: &str = "bytes";

// pprof sample label keys
pub const PROCESS_LABEL: &str = "process";
pub const CHILD_LABEL: &str = "child";
pub const THREAD_LABEL: &str = "thread";

/// File name used for kernel frames
pub const KERNEL_FILE: &str = "<kernel>";

/// Function name used when the sampler could not read a frame
pub const INVALID_FRAME: &str = "INVALID";

/// Line number used when the source line cannot be parsed
pub const UNKNOWN_LINE: u32 = 0;

/// Number of top stacks printed by the summary command
pub const DEFAULT_TOP_STACKS: usize = 10;

/// Size of the chunks read from a binary input file
pub const READ_CHUNK_SIZE: usize = 64 * 1024;
