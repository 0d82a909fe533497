//! Reading Austin output files.
//!
//! The format is detected from the first bytes: MOJO streams start with the
//! `MOJ` magic, anything else is read as collapsed stack text.

use crate::aggregator::AustinStats;
use crate::parser::{is_mojo, Decoded, Mode, RawRecord, SampleDecoder};
use crate::utils::config::READ_CHUNK_SIZE;
use crate::utils::error::{CodecError, StatsError};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Decode an input file and hand every decoded item to `sink`
///
/// **Public** - shared by all commands
///
/// # Returns
/// The mode of the stream, announced or inferred
///
/// # Errors
/// * The file cannot be read
/// * The binary stream is corrupt (reported with its byte offset)
/// * `sink` fails
pub fn decode_file<F>(path: &Path, mut sink: F) -> Result<Option<Mode>>
where
    F: FnMut(Decoded) -> Result<()>,
{
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::with_capacity(READ_CHUNK_SIZE, file);
    let mut decoder = SampleDecoder::new();

    let binary = is_mojo(reader.fill_buf().context("Failed to read input")?);
    debug!(
        "Reading {} as {}",
        path.display(),
        if binary { "MOJO" } else { "collapsed text" }
    );

    // items decoded ahead of a corrupt record reach the sink before the error
    let mut out = Vec::new();
    let mut drain = |out: &mut Vec<Decoded>, result: Result<(), CodecError>| -> Result<()> {
        for decoded in out.drain(..) {
            sink(decoded)?;
        }
        result.with_context(|| format!("Failed to decode {}", path.display()))
    };

    if binary {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut chunk).context("Failed to read input")?;
            if n == 0 {
                break;
            }
            let result = decoder.decode(RawRecord::Binary(&chunk[..n]), &mut out);
            drain(&mut out, result)?;
        }
    } else {
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).context("Failed to read input")? == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            let result = decoder.decode(RawRecord::Text(&text), &mut out);
            drain(&mut out, result)?;
        }
    }

    let result = decoder.finish(&mut out);
    drain(&mut out, result)?;

    Ok(decoder.mode())
}

/// Aggregate an input file into a call tree
///
/// Invalid records are counted and skipped. Metric overflow aborts.
pub fn load_stats(path: &Path) -> Result<AustinStats> {
    let mut stats = AustinStats::default();

    let mode = decode_file(path, |decoded| match stats.apply(decoded) {
        Ok(()) => Ok(()),
        Err(StatsError::Invalid(err)) => {
            warn!("{}", err);
            Ok(())
        }
        Err(err @ StatsError::Overflow(_)) => Err(err).context("Failed to aggregate samples"),
    })?;

    // headerless text: the decoder guessed the mode from the metric fields
    if let (None, Some(mode)) = (stats.get_metadata("mode"), mode) {
        stats.set_mode(mode);
    }

    if stats.errors() > 0 {
        warn!(
            "Skipped {} invalid records out of {}",
            stats.errors(),
            stats.errors() + stats.samples()
        );
    }

    Ok(stats)
}
