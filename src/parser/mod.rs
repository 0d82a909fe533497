//! Sample decoding and the shared data model.
//!
//! This module handles:
//! - The sample model (`Metric`, `Frame`, `Sample`, `Mode`)
//! - Frame interning
//! - The collapsed-stack text codec
//! - The MOJO binary stream codec
//! - Routing raw records to the right decoder

pub mod collapsed;
pub mod frame;
pub mod mojo;
pub mod schema;

// Re-export main types
pub use collapsed::{parse_frame, parse_metadata, parse_sample, CollapsedDecoder, CollapsedReader};
pub use frame::{FrameId, FrameTable, SharedFrameTable};
pub use mojo::{MojoDecoder, MojoWriter};
pub use schema::{AustinEvent, Decoded, Frame, Metric, MetricKind, Mode, Sample};

use crate::utils::config::MOJO_MAGIC;
use crate::utils::error::CodecError;

/// One raw record handed over by whatever reads the sampler output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawRecord<'a> {
    /// One line of collapsed-stack text
    Text(&'a str),

    /// A chunk of a MOJO stream, cut anywhere
    Binary(&'a [u8]),
}

/// True when `data` starts like a MOJO stream
pub fn is_mojo(data: &[u8]) -> bool {
    data.starts_with(MOJO_MAGIC)
}

/// Routes raw records to the text or binary decoder.
///
/// **Public** - single decoding entry point for both wire formats
///
/// Each variant keeps its own state: the text side tracks the mode and line
/// numbers, the binary side its symbol tables and partial record buffer.
#[derive(Debug, Default)]
pub struct SampleDecoder {
    text: CollapsedDecoder,
    binary: MojoDecoder,
    binary_seen: bool,
}

impl SampleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode of the stream, as announced by its metadata
    pub fn mode(&self) -> Option<Mode> {
        if self.binary_seen {
            self.binary.mode()
        } else {
            self.text.mode()
        }
    }

    /// Decode one raw record into `out`.
    ///
    /// A text line yields at most one item. A binary chunk yields whatever
    /// records it completes.
    ///
    /// # Errors
    /// * `CodecError::Corruption` - the binary stream is unreadable. Items
    ///   decoded before the fault are still pushed to `out`.
    pub fn decode(&mut self, raw: RawRecord<'_>, out: &mut Vec<Decoded>) -> Result<(), CodecError> {
        match raw {
            RawRecord::Text(line) => {
                out.extend(self.text.decode_line(line));
                Ok(())
            }
            RawRecord::Binary(chunk) => {
                self.binary_seen = true;
                self.binary.feed(chunk, out)
            }
        }
    }

    /// Flush the decoders at the end of input
    pub fn finish(&mut self, out: &mut Vec<Decoded>) -> Result<(), CodecError> {
        if self.binary_seen {
            self.binary.finish(out)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_records_are_routed() {
        let mut decoder = SampleDecoder::new();
        let mut out = Vec::new();
        decoder.decode(RawRecord::Text("# mode: cpu"), &mut out).unwrap();
        assert!(out[0].is_ok());
        decoder.decode(RawRecord::Text(""), &mut out).unwrap();
        assert_eq!(out.len(), 1);

        decoder.decode(RawRecord::Text("P1;T1;a.py:f:1 10"), &mut out).unwrap();
        assert!(matches!(&out[1], Ok(AustinEvent::Sample(s)) if s.metric.cpu == Some(10)));
        assert_eq!(decoder.mode(), Some(Mode::Cpu));
        decoder.finish(&mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_binary_records_are_routed() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "wall").stack(7, None, "t").time(4);
        let bytes = w.into_bytes();
        assert!(is_mojo(&bytes));

        let mut decoder = SampleDecoder::new();
        let (head, tail) = bytes.split_at(5);
        let mut out = Vec::new();
        decoder.decode(RawRecord::Binary(head), &mut out).unwrap();
        decoder.decode(RawRecord::Binary(tail), &mut out).unwrap();
        decoder.finish(&mut out).unwrap();

        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Ok(AustinEvent::Sample(s)) if s.pid == 7));
    }
}
