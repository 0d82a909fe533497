//! Output file plumbing.
//!
//! Exports are rendered into memory first and only then written, so a
//! failed export never leaves a partial file behind.

use crate::utils::error::OutputError;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Write a rendered export to a file
///
/// **Public** - main entry point for file output
///
/// # Arguments
/// * `output_path` - Path to the output file
/// * `bytes` - Complete rendered content
///
/// # Errors
/// * `OutputError::WriteFailed` - I/O error during write
/// * `OutputError::InvalidPath` - Path cannot be created or is invalid
///
/// The content goes to a sibling temporary file which is then renamed over
/// the target.
pub fn write_output(output_path: impl AsRef<Path>, bytes: &[u8]) -> Result<(), OutputError> {
    let output_path = output_path.as_ref();

    info!("Writing output to: {}", output_path.display());

    validate_output_path(output_path)?;

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!("Creating parent directories: {}", parent.display());
            fs::create_dir_all(parent).map_err(|e| {
                OutputError::InvalidPath(format!(
                    "Cannot create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let staging = staging_path(output_path);
    let written = File::create(&staging).and_then(|file| {
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()
    });

    if let Err(err) = written.and_then(|_| fs::rename(&staging, output_path)) {
        let _ = fs::remove_file(&staging);
        return Err(OutputError::WriteFailed(err));
    }

    info!("Output written successfully ({} bytes)", bytes.len());

    Ok(())
}

/// `<dir>/.<name>.tmp` next to the target, so the rename stays on one filesystem
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Validate that output path is writable
///
/// **Private** - internal validation
fn validate_output_path(path: &Path) -> Result<(), OutputError> {
    if path.as_os_str().is_empty() {
        return Err(OutputError::InvalidPath("Path is empty".to_string()));
    }

    if path.is_dir() {
        return Err(OutputError::InvalidPath(format!(
            "Path is a directory: {}",
            path.display()
        )));
    }

    Ok(())
}
