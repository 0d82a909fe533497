//! MOJO binary stream decoder and encoder.
//!
//! A MOJO stream starts with the magic `MOJ` followed by the format version
//! as a varint. The rest is a sequence of events, each one an event id byte
//! followed by its payload. Strings are NUL-terminated. Integers use a
//! variable-length encoding: the first byte holds a continuation bit, a sign
//! bit and 6 value bits; every following byte holds a continuation bit and 7
//! value bits.
//!
//! String and frame definitions populate per-process symbol tables that later
//! events refer to by key. A reference to a key that was never defined makes
//! the rest of the stream uninterpretable, so it is reported as
//! [`StreamCorruption`] rather than skipped.
//!
//! The decoder is fed arbitrary chunks. An incomplete trailing record is kept
//! in the buffer until more bytes arrive, so the decoded output does not
//! depend on where the chunk boundaries fall.

use super::schema::{AustinEvent, Decoded, Frame, Metric, Mode, Sample};
use crate::utils::config::{
    MOJO_EMPTY_STRING, MOJO_MAGIC, MOJO_MAX_VERSION, MOJO_UNKNOWN_STRING, UNKNOWN_LINE,
};
use crate::utils::error::{CodecError, InvalidSample, StreamCorruption};
use log::{debug, warn};
use std::collections::HashMap;

/// Event identifiers
mod event {
    pub const METADATA: u8 = 1;
    pub const STACK: u8 = 2;
    pub const FRAME: u8 = 3;
    pub const FRAME_INVALID: u8 = 4;
    pub const FRAME_REF: u8 = 5;
    pub const FRAME_KERNEL: u8 = 6;
    pub const GC: u8 = 7;
    pub const IDLE: u8 = 8;
    pub const METRIC_TIME: u8 = 9;
    pub const METRIC_MEMORY: u8 = 10;
    pub const STRING: u8 = 11;
    pub const STRING_REF: u8 = 12;
}

/// Encode an integer with the MOJO variable-length scheme
pub fn to_varint(n: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    let mut rest = n.unsigned_abs();

    let mut b = (rest & 0x3F) as u8;
    if n < 0 {
        b |= 0x40;
    }
    rest >>= 6;
    if rest != 0 {
        b |= 0x80;
    }
    out.push(b);

    while rest != 0 {
        let mut b = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest != 0 {
            b |= 0x80;
        }
        out.push(b);
    }

    out
}

/// Why a record could not be read from the buffer
#[derive(Debug)]
enum Short {
    /// The record continues past the end of the buffer
    Incomplete,
    Corrupt(String),
}

type Read<T> = Result<T, Short>;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> Read<u8> {
        let b = *self.data.get(self.pos).ok_or(Short::Incomplete)?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Read<i64> {
        let mut b = self.byte()?;
        let negative = b & 0x40 != 0;
        let mut n = u64::from(b & 0x3F);
        let mut shift = 6u32;

        while b & 0x80 != 0 {
            b = self.byte()?;
            let bits = u64::from(b & 0x7F);
            if shift >= 64 || (shift > 57 && bits >> (64 - shift) != 0) {
                return Err(Short::Corrupt("varint overflow".to_string()));
            }
            n |= bits << shift;
            shift += 7;
        }

        match (negative, i64::try_from(n)) {
            (false, Ok(v)) => Ok(v),
            (true, Ok(v)) => Ok(-v),
            (true, Err(_)) if n == 1 << 63 => Ok(i64::MIN),
            _ => Err(Short::Corrupt("varint overflow".to_string())),
        }
    }

    fn key(&mut self) -> Read<u64> {
        let v = self.varint()?;
        u64::try_from(v).map_err(|_| Short::Corrupt(format!("negative key {}", v)))
    }

    fn string(&mut self) -> Read<String> {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|b| *b == 0).ok_or(Short::Incomplete)?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }
}

/// One fully read record, not yet applied to the decoder state
#[derive(Debug)]
enum Record {
    Metadata(String, String),
    Stack {
        pid: i64,
        child: Option<i64>,
        thread: String,
    },
    Frame {
        key: u64,
        filename: u64,
        scope: u64,
        line: i64,
    },
    InvalidFrame,
    FrameRef(u64),
    KernelFrame(String),
    Gc,
    Idle,
    Time(i64),
    Memory(i64),
    String(u64, String),
    StringRef(u64),
}

fn read_record(cur: &mut Cursor<'_>, version: u64) -> Read<Record> {
    let id = cur.byte()?;

    let record = match id {
        event::METADATA => Record::Metadata(cur.string()?, cur.string()?),
        event::STACK => {
            let pid = cur.varint()?;
            let child = if version >= 3 { Some(cur.varint()?) } else { None };
            Record::Stack {
                pid,
                child,
                thread: cur.string()?,
            }
        }
        event::FRAME => {
            let key = cur.key()?;
            let filename = cur.key()?;
            let scope = cur.key()?;
            let line = cur.varint()?;
            if version >= 2 {
                // line end, column, column end: not part of frame identity
                for _ in 0..3 {
                    cur.varint()?;
                }
            }
            Record::Frame {
                key,
                filename,
                scope,
                line,
            }
        }
        event::FRAME_INVALID => Record::InvalidFrame,
        event::FRAME_REF => Record::FrameRef(cur.key()?),
        event::FRAME_KERNEL => Record::KernelFrame(cur.string()?),
        event::GC => Record::Gc,
        event::IDLE => Record::Idle,
        event::METRIC_TIME => Record::Time(cur.varint()?),
        event::METRIC_MEMORY => Record::Memory(cur.varint()?),
        event::STRING => Record::String(cur.key()?, cur.string()?),
        event::STRING_REF => Record::StringRef(cur.key()?),
        other => return Err(Short::Corrupt(format!("unknown event id {}", other))),
    };

    Ok(record)
}

/// Record the first corruption so later calls keep failing with it
fn latch(failed: &mut Option<StreamCorruption>, offset: u64, reason: impl Into<String>) -> CodecError {
    let err = StreamCorruption {
        offset,
        reason: reason.into(),
    };
    *failed = Some(err.clone());
    CodecError::Corruption(err)
}

/// Sample being assembled from the events following a stack event
#[derive(Debug)]
struct RunningSample {
    pid: u32,
    child: Option<u32>,
    thread: String,
    frames: Vec<Frame>,
    time: Option<i64>,
    memory: Option<i64>,
    idle: bool,
    gc: bool,
}

/// Streaming MOJO decoder.
///
/// **Public** - main entry point for binary records
///
/// # Example
/// ```ignore
/// let mut decoder = MojoDecoder::new();
/// let mut out = Vec::new();
/// for chunk in chunks {
///     decoder.feed(chunk, &mut out)?;
/// }
/// decoder.finish(&mut out)?;
/// ```
#[derive(Debug, Default)]
pub struct MojoDecoder {
    buffer: Vec<u8>,

    /// Absolute stream offset of `buffer[0]`
    base_offset: u64,

    version: Option<u64>,
    mode: Option<Mode>,

    strings: HashMap<(u32, u64), String>,
    frames: HashMap<(u32, u64), Frame>,

    running: Option<RunningSample>,
    failed: Option<StreamCorruption>,
}

impl MojoDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format version from the header, once read
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Mode announced by the stream metadata, once seen
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    fn corrupt(&mut self, offset: u64, reason: impl Into<String>) -> CodecError {
        latch(&mut self.failed, offset, reason)
    }

    /// Feed the next chunk of the stream.
    ///
    /// Records completed by this chunk are appended to `out`. Metadata is
    /// reported as soon as it is read; a sample is reported once the next
    /// stack event (or [`finish`](Self::finish)) closes it.
    ///
    /// # Errors
    /// * `CodecError::Corruption` - the stream cannot be decoded any further.
    ///   Records completed before the faulty one are still in `out`. The
    ///   decoder keeps failing with the same error afterwards.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Decoded>) -> Result<(), CodecError> {
        if let Some(err) = &self.failed {
            return Err(err.clone().into());
        }

        self.buffer.extend_from_slice(chunk);
        let mut pos = 0usize;

        let version = match self.version {
            Some(v) => v,
            None => match self.read_header()? {
                Some((v, len)) => {
                    pos = len;
                    v
                }
                None => return Ok(()),
            },
        };

        while pos < self.buffer.len() {
            let read = {
                let mut cur = Cursor::new(&self.buffer[pos..]);
                read_record(&mut cur, version).map(|r| (r, cur.pos))
            };
            let offset = self.base_offset + pos as u64;

            match read {
                Ok((record, len)) => {
                    pos += len;
                    self.apply(record, offset, out)?;
                }
                Err(Short::Incomplete) => break,
                Err(Short::Corrupt(reason)) => return Err(self.corrupt(offset, reason)),
            }
        }

        self.buffer.drain(..pos);
        self.base_offset += pos as u64;

        Ok(())
    }

    /// Signal the end of the stream and append the last sample to `out`.
    ///
    /// # Errors
    /// * `CodecError::Corruption` - missing header or a truncated record
    pub fn finish(&mut self, out: &mut Vec<Decoded>) -> Result<(), CodecError> {
        if let Some(err) = &self.failed {
            return Err(err.clone().into());
        }

        if self.version.is_none() {
            return Err(self.corrupt(self.base_offset, "missing or truncated MOJO header"));
        }

        if !self.buffer.is_empty() {
            let reason = format!("truncated record ({} trailing bytes)", self.buffer.len());
            return Err(self.corrupt(self.base_offset, reason));
        }

        out.extend(self.finalize());
        Ok(())
    }

    /// Read the header once enough bytes are buffered.
    /// Returns the version and the header length.
    fn read_header(&mut self) -> Result<Option<(u64, usize)>, CodecError> {
        let magic_len = MOJO_MAGIC.len();
        let prefix = &self.buffer[..self.buffer.len().min(magic_len)];
        if prefix != &MOJO_MAGIC[..prefix.len()] {
            return Err(self.corrupt(0, "not a MOJO stream"));
        }
        if self.buffer.len() <= magic_len {
            return Ok(None);
        }

        let read = {
            let mut cur = Cursor::new(&self.buffer[magic_len..]);
            cur.varint().map(|v| (v, magic_len + cur.pos))
        };
        let (version, len) = match read {
            Ok(v) => v,
            Err(Short::Incomplete) => return Ok(None),
            Err(Short::Corrupt(reason)) => return Err(self.corrupt(magic_len as u64, reason)),
        };

        let version = match u64::try_from(version) {
            Ok(v) if v >= 1 => v,
            _ => {
                return Err(self.corrupt(
                    magic_len as u64,
                    format!("invalid MOJO version {}", version),
                ))
            }
        };
        if version > MOJO_MAX_VERSION {
            warn!(
                "MOJO version {} is newer than {}, decoding with the version {} layout",
                version, MOJO_MAX_VERSION, MOJO_MAX_VERSION
            );
        }
        debug!("MOJO stream version {}", version);

        self.version = Some(version);
        Ok(Some((version, len)))
    }

    fn running(&mut self, offset: u64) -> Result<&mut RunningSample, CodecError> {
        match self.running.as_mut() {
            Some(running) => Ok(running),
            None => Err(latch(&mut self.failed, offset, "event outside of a stack")),
        }
    }

    fn current_pid(&mut self, offset: u64) -> Result<u32, CodecError> {
        Ok(self.running(offset)?.pid)
    }

    fn lookup_string(&mut self, pid: u32, key: u64, offset: u64) -> Result<String, CodecError> {
        if key == MOJO_EMPTY_STRING.0 {
            return Ok(MOJO_EMPTY_STRING.1.to_string());
        }
        if key == MOJO_UNKNOWN_STRING.0 {
            return Ok(MOJO_UNKNOWN_STRING.1.to_string());
        }
        match self.strings.get(&(pid, key)) {
            Some(s) => Ok(s.clone()),
            None => Err(self.corrupt(offset, format!("undefined string {} in process {}", key, pid))),
        }
    }

    fn apply(&mut self, record: Record, offset: u64, out: &mut Vec<Decoded>) -> Result<(), CodecError> {
        match record {
            Record::Metadata(name, value) => {
                if name == "mode" {
                    match value.parse::<Mode>() {
                        Ok(mode) => self.mode = Some(mode),
                        Err(err) => out.push(Err(err)),
                    }
                }
                out.push(Ok(AustinEvent::Metadata { name, value }));
            }

            Record::Stack { pid, child, thread } => {
                let pid = u32::try_from(pid)
                    .map_err(|_| self.corrupt(offset, format!("invalid process ID {}", pid)))?;
                let child = match child.map(u32::try_from).transpose() {
                    Ok(child) => child.filter(|c| *c != 0),
                    Err(_) => {
                        let reason = format!("invalid child ID {}", child.unwrap_or_default());
                        return Err(self.corrupt(offset, reason));
                    }
                };

                if let Some(done) = self.finalize() {
                    out.push(done);
                }
                self.running = Some(RunningSample {
                    pid,
                    child,
                    thread,
                    frames: Vec::new(),
                    time: None,
                    memory: None,
                    idle: false,
                    gc: false,
                });
            }

            Record::Frame {
                key,
                filename,
                scope,
                line,
            } => {
                let pid = self.current_pid(offset)?;
                let file = self.lookup_string(pid, filename, offset)?;
                let function = self.lookup_string(pid, scope, offset)?;
                let line = u32::try_from(line).unwrap_or(UNKNOWN_LINE);
                let frame = Frame::new(function, file, line);

                match self.frames.get(&(pid, key)) {
                    Some(existing) if *existing != frame => {
                        return Err(self.corrupt(offset, format!("frame {} redefined", key)));
                    }
                    Some(_) => {}
                    None => {
                        self.frames.insert((pid, key), frame);
                    }
                }
            }

            Record::FrameRef(key) => {
                let pid = self.current_pid(offset)?;
                let frame = match self.frames.get(&(pid, key)) {
                    Some(frame) => frame.clone(),
                    None => {
                        return Err(self.corrupt(
                            offset,
                            format!("undefined frame {} in process {}", key, pid),
                        ))
                    }
                };
                self.running(offset)?.frames.push(frame);
            }

            Record::InvalidFrame => self.running(offset)?.frames.push(Frame::invalid()),
            Record::KernelFrame(name) => self.running(offset)?.frames.push(Frame::kernel(name)),
            Record::Gc => self.running(offset)?.gc = true,
            Record::Idle => self.running(offset)?.idle = true,
            Record::Time(v) => self.running(offset)?.time = Some(v),
            Record::Memory(v) => self.running(offset)?.memory = Some(v),

            Record::String(key, value) => {
                let pid = self.current_pid(offset)?;
                match self.strings.get(&(pid, key)) {
                    Some(existing) if *existing != value => {
                        return Err(self.corrupt(offset, format!("string {} redefined", key)));
                    }
                    Some(_) => {}
                    None => {
                        self.strings.insert((pid, key), value);
                    }
                }
            }

            Record::StringRef(key) => {
                let pid = self.current_pid(offset)?;
                self.lookup_string(pid, key, offset)?;
            }
        }

        Ok(())
    }

    /// Close the running sample, if any
    fn finalize(&mut self) -> Option<Decoded> {
        let running = self.running.take()?;
        let mode = self.mode.unwrap_or_default();

        let time = match running.time.map(u64::try_from) {
            Some(Err(_)) => {
                return Some(Err(InvalidSample::new(format!(
                    "negative time metric in sample for process {}",
                    running.pid
                ))))
            }
            Some(Ok(t)) => Some(t),
            None => None,
        };

        let decoded = Metric::from_raw(mode, time, running.idle, running.memory).map(|metric| {
            AustinEvent::Sample(Sample {
                pid: running.pid,
                child: running.child,
                thread: running.thread,
                frames: running.frames,
                metric,
                gc: running.gc,
            })
        });

        Some(decoded)
    }
}

/// MOJO stream encoder.
///
/// Produces streams the [`MojoDecoder`] reads back. [`write_sample`](Self::write_sample)
/// takes care of emitting string and frame definitions the first time they
/// are needed in each process.
#[derive(Debug, Clone)]
pub struct MojoWriter {
    buf: Vec<u8>,
    version: u64,
    strings: HashMap<(u32, String), u64>,
    frames: HashMap<(u32, Frame), u64>,
    next_key: u64,
}

impl MojoWriter {
    pub fn new(version: u64) -> Self {
        let mut buf = MOJO_MAGIC.to_vec();
        buf.extend(to_varint(version as i64));
        Self {
            buf,
            version,
            strings: HashMap::new(),
            frames: HashMap::new(),
            // keys 0 and 1 are implicit
            next_key: 2,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn int(&mut self, n: i64) -> &mut Self {
        self.buf.extend(to_varint(n));
        self
    }

    fn cstr(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    fn id(&mut self, id: u8) -> &mut Self {
        self.buf.push(id);
        self
    }

    pub fn metadata(&mut self, name: &str, value: &str) -> &mut Self {
        self.id(event::METADATA).cstr(name).cstr(value)
    }

    pub fn stack(&mut self, pid: u32, child: Option<u32>, thread: &str) -> &mut Self {
        self.id(event::STACK).int(i64::from(pid));
        if self.version >= 3 {
            self.int(i64::from(child.unwrap_or(0)));
        }
        self.cstr(thread)
    }

    pub fn string(&mut self, key: u64, value: &str) -> &mut Self {
        self.id(event::STRING).int(key as i64).cstr(value)
    }

    pub fn string_ref(&mut self, key: u64) -> &mut Self {
        self.id(event::STRING_REF).int(key as i64)
    }

    pub fn frame(&mut self, key: u64, filename: u64, scope: u64, line: u32) -> &mut Self {
        self.id(event::FRAME)
            .int(key as i64)
            .int(filename as i64)
            .int(scope as i64)
            .int(i64::from(line));
        if self.version >= 2 {
            self.int(i64::from(line)).int(0).int(0);
        }
        self
    }

    pub fn frame_ref(&mut self, key: u64) -> &mut Self {
        self.id(event::FRAME_REF).int(key as i64)
    }

    pub fn invalid_frame(&mut self) -> &mut Self {
        self.id(event::FRAME_INVALID)
    }

    pub fn kernel_frame(&mut self, name: &str) -> &mut Self {
        self.id(event::FRAME_KERNEL).cstr(name)
    }

    pub fn gc(&mut self) -> &mut Self {
        self.id(event::GC)
    }

    pub fn idle(&mut self) -> &mut Self {
        self.id(event::IDLE)
    }

    pub fn time(&mut self, us: i64) -> &mut Self {
        self.id(event::METRIC_TIME).int(us)
    }

    pub fn memory(&mut self, bytes: i64) -> &mut Self {
        self.id(event::METRIC_MEMORY).int(bytes)
    }

    fn string_key(&mut self, pid: u32, value: &str) -> u64 {
        if let Some(key) = self.strings.get(&(pid, value.to_string())) {
            return *key;
        }
        let key = self.next_key;
        self.next_key += 1;
        self.strings.insert((pid, value.to_string()), key);
        self.string(key, value);
        key
    }

    fn frame_key(&mut self, pid: u32, frame: &Frame) -> u64 {
        if let Some(key) = self.frames.get(&(pid, frame.clone())) {
            return *key;
        }
        let file = self.string_key(pid, &frame.file);
        let scope = self.string_key(pid, &frame.function);
        let key = self.next_key;
        self.next_key += 1;
        self.frames.insert((pid, frame.clone()), key);
        self.frame(key, file, scope, frame.line);
        key
    }

    /// Encode a full sample with the metric layout of `mode`
    pub fn write_sample(&mut self, sample: &Sample, mode: Mode) -> &mut Self {
        self.stack(sample.pid, sample.child, &sample.thread);

        for frame in &sample.frames {
            let key = self.frame_key(sample.pid, frame);
            self.frame_ref(key);
        }

        if sample.gc {
            self.gc();
        }
        if sample.metric.idle {
            self.idle();
        }

        let wall = i64::try_from(sample.metric.wall).unwrap_or(i64::MAX);
        match mode {
            Mode::Wall | Mode::Cpu => {
                self.time(wall);
            }
            Mode::Memory => {
                self.memory(sample.metric.net_memory());
            }
            Mode::Full => {
                self.time(wall).memory(sample.metric.net_memory());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn samples(decoded: Vec<Decoded>) -> Vec<Sample> {
        decoded
            .into_iter()
            .filter_map(|d| match d {
                Ok(AustinEvent::Sample(s)) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn decode(bytes: &[u8]) -> Result<Vec<Decoded>, CodecError> {
        let mut decoder = MojoDecoder::new();
        let mut out = Vec::new();
        decoder.feed(bytes, &mut out)?;
        decoder.finish(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_varint_round_trip() {
        for n in [0i64, 1, 63, 64, -1, -64, 8191, 1 << 40, i64::MAX, i64::MIN + 1, i64::MIN] {
            let bytes = to_varint(n);
            let mut cur = Cursor::new(&bytes);
            assert_eq!(cur.varint().unwrap(), n, "varint {}", n);
            assert_eq!(cur.pos, bytes.len());
        }
    }

    #[test]
    fn test_varint_small_values_fit_one_byte() {
        assert_eq!(to_varint(5), vec![5]);
        assert_eq!(to_varint(-5), vec![0x45]);
        assert_eq!(to_varint(64), vec![0x80, 0x01]);
    }

    #[test]
    fn test_decode_simple_stream() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "wall")
            .stack(42, None, "0x1")
            .string(2, "main.py")
            .string(3, "main")
            .frame(10, 2, 3, 7)
            .frame_ref(10)
            .time(150);

        let mut decoder = MojoDecoder::new();
        let mut decoded = Vec::new();
        decoder.feed(w.bytes(), &mut decoded).unwrap();
        decoder.finish(&mut decoded).unwrap();

        assert_eq!(decoder.version(), Some(3));
        assert_eq!(decoder.mode(), Some(Mode::Wall));
        assert!(matches!(&decoded[0], Ok(AustinEvent::Metadata { name, .. }) if name == "mode"));

        let samples = samples(decoded);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].pid, 42);
        assert_eq!(samples[0].frames, vec![Frame::new("main", "main.py", 7)]);
        assert_eq!(samples[0].metric, Metric::wall(150));
    }

    #[test]
    fn test_idle_and_memory_in_full_mode() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "full")
            .stack(1, Some(2), "t")
            .idle()
            .time(10)
            .memory(-8);

        let decoded = decode(w.bytes()).unwrap();
        let s = &samples(decoded)[0];

        assert_eq!(s.child, Some(2));
        assert!(s.metric.idle);
        assert_eq!(s.metric.cpu, Some(0));
        assert_eq!(s.metric.wall, 10);
        assert_eq!(s.metric.memory_dealloc, Some(8));
    }

    #[test]
    fn test_undefined_string_reports_record_offset() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "wall").stack(1, None, "t").string(2, "a.py");
        let offset = w.len() as u64;
        w.frame(5, 2, 99, 1);

        let mut decoder = MojoDecoder::new();
        let mut out = Vec::new();
        match decoder.feed(w.bytes(), &mut out) {
            Err(CodecError::Corruption(err)) => {
                assert_eq!(err.offset, offset);
                assert!(err.reason.contains("undefined string 99"));
            }
            other => panic!("expected corruption, got {:?}", other),
        }

        // The decoder stays failed
        assert!(decoder.feed(&[], &mut out).is_err());
        assert!(out.iter().all(|d| matches!(d, Ok(AustinEvent::Metadata { .. }))));
    }

    #[test]
    fn test_undefined_frame_reference() {
        let mut w = MojoWriter::new(1);
        w.stack(1, None, "t").frame_ref(3);
        let err = decode(w.bytes()).unwrap_err();
        assert!(matches!(err, CodecError::Corruption(_)));
    }

    #[test]
    fn test_string_redefinition_is_corruption() {
        let mut w = MojoWriter::new(3);
        w.stack(1, None, "t").string(2, "a").string(2, "a").string(2, "b");
        assert!(decode(w.bytes()).is_err());
    }

    #[test]
    fn test_string_tables_are_per_process() {
        let mut w = MojoWriter::new(3);
        w.stack(1, None, "t").string(2, "a.py").string(3, "f").frame(4, 2, 3, 1);
        w.stack(2, None, "t").frame_ref(4);
        assert!(decode(w.bytes()).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let err = decode(b"NOPE").unwrap_err();
        assert!(matches!(err, CodecError::Corruption(StreamCorruption { offset: 0, .. })));
    }

    #[test]
    fn test_truncated_header_and_record() {
        let mut decoder = MojoDecoder::new();
        let mut out = Vec::new();
        decoder.feed(b"MO", &mut out).unwrap();
        assert!(out.is_empty());
        assert!(decoder.finish(&mut out).is_err());

        let mut w = MojoWriter::new(3);
        w.stack(1, None, "thread");
        let bytes = w.into_bytes();
        let mut decoder = MojoDecoder::new();
        decoder.feed(&bytes[..bytes.len() - 2], &mut out).unwrap();
        assert!(decoder.finish(&mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_chunked_feed_matches_single_feed() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "full");
        for i in 0..20u32 {
            let frames = (0..(i % 4 + 1))
                .map(|d| Frame::new(format!("f{}", d), "m.py", d + 1))
                .collect();
            let metric = Metric::from_raw(Mode::Full, Some(u64::from(i) * 3), i % 3 == 0, Some(i as i64 - 5))
                .unwrap();
            w.write_sample(&Sample::new(i % 2, "t", frames, metric), Mode::Full);
        }
        let bytes = w.into_bytes();

        let expected = decode(&bytes).unwrap();

        for chunk_size in [1, 2, 3, 7, 64] {
            let mut decoder = MojoDecoder::new();
            let mut got = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                decoder.feed(chunk, &mut got).unwrap();
            }
            decoder.finish(&mut got).unwrap();
            assert_eq!(got, expected, "chunk size {}", chunk_size);
        }
        assert_eq!(samples(expected).len(), 20);
    }

    #[test]
    fn test_missing_time_metric_is_invalid_sample() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "wall").stack(1, None, "t").stack(1, None, "t").time(5);

        let decoded = decode(w.bytes()).unwrap();

        assert_eq!(decoded.len(), 3);
        assert!(decoded[1].is_err());
        assert!(decoded[2].is_ok());
    }

    #[test]
    fn test_special_frames() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "cpu")
            .stack(1, None, "t")
            .invalid_frame()
            .kernel_frame("do_syscall_64")
            .gc()
            .time(3);

        let decoded = decode(w.bytes()).unwrap();
        let s = &samples(decoded)[0];

        assert_eq!(s.frames, vec![Frame::invalid(), Frame::kernel("do_syscall_64")]);
        assert!(s.gc);
        assert_eq!(s.metric.cpu, Some(3));
    }

    #[test]
    fn test_single_feed_keeps_samples_before_corruption() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "wall")
            .stack(1, None, "t")
            .string(2, "a.py")
            .string(3, "f")
            .frame(4, 2, 3, 1)
            .frame_ref(4)
            .time(10)
            .stack(1, None, "t")
            .frame_ref(9);

        let mut decoder = MojoDecoder::new();
        let mut out = Vec::new();
        let err = decoder.feed(w.bytes(), &mut out).unwrap_err();

        assert!(matches!(err, CodecError::Corruption(c) if c.reason.contains("undefined frame 9")));
        let samples = samples(out);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].frames, vec![Frame::new("f", "a.py", 1)]);
        assert_eq!(samples[0].metric, Metric::wall(10));
    }

    #[test]
    fn test_invalid_child_id_is_corruption() {
        for child in [-1i64, 1 << 40] {
            let mut bytes = MOJO_MAGIC.to_vec();
            bytes.extend(to_varint(3));
            let offset = bytes.len() as u64;
            bytes.push(event::STACK);
            bytes.extend(to_varint(1));
            bytes.extend(to_varint(child));
            bytes.extend_from_slice(b"t\0");

            match decode(&bytes).unwrap_err() {
                CodecError::Corruption(c) => {
                    assert_eq!(c.offset, offset);
                    assert!(c.reason.contains("invalid child ID"), "{}", c.reason);
                }
                other => panic!("expected corruption, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_event_outside_stack_stays_failed() {
        let mut w = MojoWriter::new(3);
        w.metadata("mode", "wall");
        let offset = w.len() as u64;
        w.time(5);

        let mut decoder = MojoDecoder::new();
        let mut out = Vec::new();
        let first = decoder.feed(w.bytes(), &mut out).unwrap_err();
        assert!(matches!(&first, CodecError::Corruption(c) if c.offset == offset));

        // later calls report the same corruption
        let again = decoder.feed(&[], &mut out).unwrap_err();
        assert_eq!(again, first);
        assert_eq!(decoder.finish(&mut out).unwrap_err(), first);
    }
}
