//! Collapsed stack text format.
//!
//! One sample per line:
//!
//! ```text
//! P<pid>;T[<child>:]<thread>[;<file>:<function>:<line>]* <metrics>
//! ```
//!
//! The metric field depends on the mode announced by the `# mode: <m>`
//! header: a single integer for `cpu`, `wall` and `memory`, and
//! `<time>,<idle>,<memory>` for `full`. Header and footer lines have the
//! form `# <key>: <value>`.
//!
//! Example: `P42;T7;main.py:<module>:1;main.py:work:12 1000`

use super::schema::{AustinEvent, Decoded, Frame, Metric, Mode, Sample};
use crate::utils::config::UNKNOWN_LINE;
use crate::utils::error::InvalidSample;
use log::debug;
use std::io::BufRead;

/// Parse a frame descriptor of the form `<file>:<function>:<line>`.
///
/// **Public** - also used to parse stack signatures
///
/// A line number that is not an integer is replaced by `0` rather than
/// rejecting the whole record. Descriptors with fewer than three parts are
/// invalid.
pub fn parse_frame(descriptor: &str) -> Result<Frame, InvalidSample> {
    let mut parts = descriptor.rsplitn(3, ':');
    let (line, function, file) = match (parts.next(), parts.next(), parts.next()) {
        (Some(line), Some(function), Some(file)) => (line, function, file),
        _ => {
            return Err(InvalidSample::new(format!(
                "invalid frame '{}'",
                descriptor
            )))
        }
    };

    Ok(Frame::new(function, file, parse_line_number(line)))
}

fn parse_line_number(raw: &str) -> u32 {
    raw.parse::<u32>().unwrap_or_else(|_| {
        debug!("Unparsable line number '{}', using {}", raw, UNKNOWN_LINE);
        UNKNOWN_LINE
    })
}

/// `L<digits>` token of the legacy `<file>:<function>;L<line>` layout
fn legacy_line_token(token: &str) -> Option<u32> {
    let digits = token.strip_prefix('L')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse the `;`-separated frame list of a sample
fn parse_frames(frames_data: &str) -> Result<Vec<Frame>, InvalidSample> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut awaiting_line = false;

    for token in frames_data.split(';') {
        if let Some(line) = legacy_line_token(token) {
            match frames.last_mut() {
                Some(frame) if awaiting_line => frame.line = line,
                _ => {
                    return Err(InvalidSample::new(format!(
                        "unexpected line token '{}'",
                        token
                    )))
                }
            }
            awaiting_line = false;
            continue;
        }

        if awaiting_line {
            return Err(InvalidSample::new("frame without line number"));
        }

        match parse_frame(token) {
            Ok(frame) => frames.push(frame),
            Err(err) => {
                // Legacy layout carries the line in the next token
                let (file, function) = token.rsplit_once(':').ok_or(err)?;
                frames.push(Frame::new(function, file, UNKNOWN_LINE));
                awaiting_line = true;
            }
        }
    }

    if awaiting_line {
        return Err(InvalidSample::new("frame without line number"));
    }

    Ok(frames)
}

fn parse_int<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, InvalidSample> {
    raw.parse::<T>()
        .map_err(|_| InvalidSample::new(format!("non-numeric {} '{}'", what, raw)))
}

/// Parse the metric field according to the mode layout
fn parse_metrics(raw: &str, mode: Mode) -> Result<Metric, InvalidSample> {
    let fields: Vec<&str> = raw.split(',').collect();

    match (mode, fields.as_slice()) {
        (Mode::Full, [time, idle, memory]) => {
            let idle = match *idle {
                "0" => false,
                "1" => true,
                other => return Err(InvalidSample::new(format!("invalid idle flag '{}'", other))),
            };
            Metric::from_raw(
                mode,
                Some(parse_int(time, "time")?),
                idle,
                Some(parse_int(memory, "memory")?),
            )
        }
        (Mode::Memory, [memory]) => {
            Metric::from_raw(mode, None, false, Some(parse_int(memory, "memory")?))
        }
        (Mode::Cpu | Mode::Wall, [time]) => {
            Metric::from_raw(mode, Some(parse_int(time, "time")?), false, None)
        }
        _ => Err(InvalidSample::new(format!(
            "expected {} metric field(s) in {} mode, found {}",
            if mode == Mode::Full { 3 } else { 1 },
            mode,
            fields.len()
        ))),
    }
}

/// Parse one collapsed stack line into a [`Sample`].
///
/// **Public** - main entry point for text records
///
/// # Arguments
/// * `line` - A single line, without the trailing newline
/// * `mode` - Mode of the stream, fixes the metric layout
///
/// # Errors
/// * `InvalidSample` - empty line, missing process or thread head,
///   missing or malformed metrics, invalid frame descriptors
pub fn parse_sample(line: &str, mode: Mode) -> Result<Sample, InvalidSample> {
    if line.is_empty() {
        return Err(InvalidSample::new("empty line"));
    }

    let Some(rest) = line.strip_prefix('P') else {
        return Err(InvalidSample::new(format!("no process ID in sample '{}'", line)));
    };

    let (head, metrics) = rest
        .rsplit_once(' ')
        .ok_or_else(|| InvalidSample::new(format!("no metrics in sample '{}'", line)))?;

    let (pid, rest) = head
        .split_once(';')
        .ok_or_else(|| InvalidSample::new(format!("no thread ID in sample '{}'", line)))?;
    let pid: u32 = parse_int(pid, "process ID")?;

    let Some(rest) = rest.strip_prefix('T') else {
        return Err(InvalidSample::new(format!("no thread ID in sample '{}'", line)));
    };

    let (thread, frames_data) = match rest.split_once(';') {
        Some((thread, frames)) => (thread, Some(frames)),
        None => (rest, None),
    };

    let (child, thread) = match thread.split_once(':') {
        Some((child, thread)) => (Some(parse_int::<u32>(child, "child ID")?), thread),
        None => (None, thread),
    };

    if thread.is_empty() {
        return Err(InvalidSample::new(format!("empty thread ID in sample '{}'", line)));
    }

    let frames = match frames_data {
        Some(data) => parse_frames(data)?,
        None => Vec::new(),
    };

    let metric = parse_metrics(metrics, mode)?;
    let gc = frames.iter().any(|f| f.function == "GC");

    Ok(Sample {
        gc,
        ..Sample::new(pid, thread, frames, metric).with_child(child)
    })
}

/// Parse a `# key: value` metadata line.
///
/// Returns `None` when the line is not metadata.
pub fn parse_metadata(line: &str) -> Option<(String, String)> {
    let body = line.strip_prefix("# ")?.trim();
    let (key, value) = body.split_once(": ").unwrap_or((body, ""));
    Some((key.to_string(), value.to_string()))
}

/// Guess the mode of a headerless stream from the shape of a sample line
pub fn infer_mode(line: &str) -> Mode {
    match line.rsplit_once(' ') {
        Some((_, metrics)) if metrics.split(',').count() == 3 => Mode::Full,
        _ => Mode::Wall,
    }
}

/// Render a frame back into its descriptor
pub fn format_frame(frame: &Frame) -> String {
    frame.to_string()
}

/// `P<pid>;T[<child>:]<thread>` head of a sample line
pub fn format_head(pid: u32, child: Option<u32>, thread: &str) -> String {
    match child {
        Some(child) => format!("P{};T{}:{}", pid, child, thread),
        None => format!("P{};T{}", pid, thread),
    }
}

/// Render a metric in the layout of `mode`.
///
/// Memory is rendered as the net delta, the only value the text format
/// can carry.
pub fn format_metric(metric: &Metric, mode: Mode) -> String {
    match mode {
        Mode::Wall => metric.wall.to_string(),
        Mode::Cpu => metric.cpu.unwrap_or(metric.wall).to_string(),
        Mode::Memory => metric.net_memory().to_string(),
        Mode::Full => format!(
            "{},{},{}",
            metric.wall,
            u8::from(metric.idle),
            metric.net_memory()
        ),
    }
}

/// Render an accumulated metric as the metric fields of one or more lines.
///
/// Reading the lines back and adding them up gives the metric again. In
/// `full` mode the idle share of the wall time goes on its own line, and
/// allocations and deallocations go on separate lines. `cpu` mode has no
/// room for idle wall time, so only the CPU time is kept.
pub fn format_metric_lines(metric: &Metric, mode: Mode) -> Vec<String> {
    let memory: Vec<i64> = [
        metric.memory_alloc.unwrap_or(0),
        0i64.saturating_sub(metric.memory_dealloc.unwrap_or(0)),
    ]
    .into_iter()
    .filter(|m| *m != 0)
    .collect();

    match mode {
        Mode::Wall | Mode::Cpu => vec![format_metric(metric, mode)],
        Mode::Memory if memory.is_empty() => vec!["0".to_string()],
        Mode::Memory => memory.iter().map(i64::to_string).collect(),
        Mode::Full => {
            let busy = metric.cpu.unwrap_or(metric.wall).min(metric.wall);
            let times: Vec<(u64, bool)> = [(busy, false), (metric.wall - busy, true)]
                .into_iter()
                .filter(|(t, _)| *t != 0)
                .collect();

            (0..times.len().max(memory.len()).max(1))
                .map(|i| {
                    let (time, idle) = times.get(i).copied().unwrap_or((0, false));
                    let m = memory.get(i).copied().unwrap_or(0);
                    format!("{},{},{}", time, u8::from(idle), m)
                })
                .collect()
        }
    }
}

/// Render a sample as a collapsed stack line
pub fn format_sample(sample: &Sample, mode: Mode) -> String {
    let mut line = format_head(sample.pid, sample.child, &sample.thread);
    for frame in &sample.frames {
        line.push(';');
        line.push_str(&format_frame(frame));
    }
    line.push(' ');
    line.push_str(&format_metric(&sample.metric, mode));
    line
}

/// Stateful line decoder: remembers the mode and the line number
#[derive(Debug, Clone, Default)]
pub struct CollapsedDecoder {
    mode: Option<Mode>,
    line_no: usize,
}

impl CollapsedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Number of lines seen so far
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Decode the next line of the stream.
    ///
    /// Returns `None` for blank lines, which carry nothing.
    pub fn decode_line(&mut self, line: &str) -> Option<Decoded> {
        self.line_no += 1;
        let line = line.trim_end_matches(['\n', '\r']);

        if line.is_empty() {
            return None;
        }

        if let Some((name, value)) = parse_metadata(line) {
            if name == "mode" {
                match value.parse::<Mode>() {
                    Ok(mode) => self.mode = Some(mode),
                    Err(err) => return Some(Err(err.at_line(self.line_no))),
                }
            }
            return Some(Ok(AustinEvent::Metadata { name, value }));
        }

        // without a header, the first line that parses fixes the mode
        let (mode, inferred) = match self.mode {
            Some(mode) => (mode, false),
            None => (infer_mode(line), true),
        };

        let parsed = parse_sample(line, mode);
        if inferred && parsed.is_ok() {
            debug!("No mode header, assuming {} mode", mode);
            self.mode = Some(mode);
        }

        Some(
            parsed
                .map(AustinEvent::Sample)
                .map_err(|err| err.at_line(self.line_no)),
        )
    }
}

/// Iterator over the records of a collapsed stack stream.
///
/// Blank lines are skipped. Each item carries the 1-based line number.
pub struct CollapsedReader<R> {
    source: R,
    decoder: CollapsedDecoder,
    buffer: String,
}

impl<R: BufRead> CollapsedReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            decoder: CollapsedDecoder::new(),
            buffer: String::new(),
        }
    }

    pub fn mode(&self) -> Option<Mode> {
        self.decoder.mode()
    }
}

impl<R: BufRead> Iterator for CollapsedReader<R> {
    type Item = std::io::Result<(usize, Decoded)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.source.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    if let Some(decoded) = self.decoder.decode_line(&self.buffer) {
                        return Some(Ok((self.decoder.line_no(), decoded)));
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_frame_valid() {
        assert_eq!(
            parse_frame("/tmp/bar.py:foo:10").unwrap(),
            Frame::new("foo", "/tmp/bar.py", 10)
        );
        assert_eq!(
            parse_frame("<module>:foo:42").unwrap(),
            Frame::new("foo", "<module>", 42)
        );
        assert_eq!(
            parse_frame("C:\\lib\\x.py:run:3").unwrap(),
            Frame::new("run", "C:\\lib\\x.py", 3)
        );
    }

    #[test]
    fn test_parse_frame_bad_line_uses_sentinel() {
        assert_eq!(
            parse_frame("foo.py:bar:abc").unwrap(),
            Frame::new("bar", "foo.py", UNKNOWN_LINE)
        );
    }

    #[test]
    fn test_parse_frame_invalid() {
        assert!(parse_frame("snafu").is_err());
        assert!(parse_frame("").is_err());
        assert!(parse_frame("foo (<module>:bar)").is_err());
    }

    #[test]
    fn test_parse_sample_valid() {
        let sample = parse_sample(
            "P123;T0x7f546684;foo_module.py:foo:10;bar_module.py:bar:20 42",
            Mode::Wall,
        )
        .unwrap();

        assert_eq!(sample.pid, 123);
        assert_eq!(sample.child, None);
        assert_eq!(sample.thread, "0x7f546684");
        assert_eq!(
            sample.frames,
            vec![
                Frame::new("foo", "foo_module.py", 10),
                Frame::new("bar", "bar_module.py", 20)
            ]
        );
        assert_eq!(sample.metric, Metric::wall(42));
    }

    #[test]
    fn test_parse_sample_full_mode() {
        let sample = parse_sample("P1;T0x7f546684 42,0,44", Mode::Full).unwrap();
        assert!(sample.frames.is_empty());
        assert_eq!(sample.metric.wall, 42);
        assert_eq!(sample.metric.cpu, Some(42));
        assert_eq!(sample.metric.memory_alloc, Some(44));
        assert_eq!(sample.metric.memory_dealloc, Some(0));
    }

    #[test]
    fn test_parse_sample_child_id() {
        let sample = parse_sample("P1;T2:7;a.py:f:1 5", Mode::Wall).unwrap();
        assert_eq!(sample.child, Some(2));
        assert_eq!(sample.thread, "7");

        let main = parse_sample("P1;T0:7;a.py:f:1 5", Mode::Wall).unwrap();
        assert_eq!(main.child, None);
    }

    #[test]
    fn test_parse_sample_legacy_line_tokens() {
        let sample = parse_sample(
            "P1;T7fdf1b437700;/usr/lib/python3.6/threading.py:_bootstrap;L884;\
             test/target34.py:keep_cpu_busy;L31 10085",
            Mode::Wall,
        )
        .unwrap();

        assert_eq!(
            sample.frames,
            vec![
                Frame::new("_bootstrap", "/usr/lib/python3.6/threading.py", 884),
                Frame::new("keep_cpu_busy", "test/target34.py", 31),
            ]
        );
    }

    #[test]
    fn test_parse_sample_invalid() {
        let cases = [
            "",
            "foo_module.py:foo:10;bar_module.py:bar:20 42,43,-44",
            "P123;foo_module.py:foo:10;bar_module.py:bar:20 42",
            "snafu",
            "P1;T0x7f546684;foo_module.py:foo:10;bar_module.py:bar:20",
            "P1;T0x7f546684;foo_module.py:foo:10;snafu 10",
            "P1;T0x7f546684;foo_module.py:foo:10 ten",
            "Px;T1;a.py:f:1 10",
        ];
        for case in cases {
            assert!(parse_sample(case, Mode::Wall).is_err(), "accepted '{}'", case);
        }

        assert!(parse_sample("P1;T0x7f546684;foo_module.py:foo:10 10,20", Mode::Full).is_err());
        assert!(parse_sample("P1;T1;a.py:f:1 10,20,30,40", Mode::Full).is_err());
        assert!(parse_sample("P1;T1;a.py:f:1 10,2,30", Mode::Full).is_err());
        assert!(parse_sample("P1;T1;a.py:f:1 10,0,30", Mode::Wall).is_err());
    }

    #[test]
    fn test_format_sample_round_trip() {
        let line = "P1;T2:7;a.py:f:1;b.py:g:2 10,1,-5";
        let sample = parse_sample(line, Mode::Full).unwrap();
        assert_eq!(format_sample(&sample, Mode::Full), line);
    }

    #[test]
    fn test_parse_metadata() {
        assert_eq!(
            parse_metadata("# mode: wall"),
            Some(("mode".to_string(), "wall".to_string()))
        );
        assert_eq!(parse_metadata("P1;T1 1"), None);
    }

    #[test]
    fn test_reader_tracks_mode_and_lines() {
        let text = "# mode: full\n\nP1;T1;a.py:f:1 10,0,5\nP1;T1 oops\n";
        let items: Vec<_> = CollapsedReader::new(text.as_bytes())
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(items.len(), 3);
        assert!(matches!(items[0].1, Ok(AustinEvent::Metadata { .. })));
        assert_eq!(items[1].0, 3);
        match &items[1].1 {
            Ok(AustinEvent::Sample(sample)) => assert_eq!(sample.metric.memory_alloc, Some(5)),
            other => panic!("unexpected {:?}", other),
        }
        let err = items[2].1.clone().unwrap_err();
        assert_eq!(err.line, Some(4));
    }

    #[test]
    fn test_decoder_infers_mode_without_header() {
        let mut decoder = CollapsedDecoder::new();
        let decoded = decoder.decode_line("P1;T1;a.py:f:1 10,1,0").unwrap();
        assert!(decoded.is_ok());
        assert_eq!(decoder.mode(), Some(Mode::Full));
    }

    #[test]
    fn test_garbage_line_does_not_fix_mode() {
        let mut decoder = CollapsedDecoder::new();
        assert!(decoder.decode_line("oops").unwrap().is_err());
        assert_eq!(decoder.mode(), None);

        let decoded = decoder.decode_line("P1;T1;a.py:f:1 10,1,0").unwrap();
        assert!(decoded.is_ok());
        assert_eq!(decoder.mode(), Some(Mode::Full));
        assert!(decoder.decode_line("P1;T1;a.py:f:1 7,0,3").unwrap().is_ok());
    }

    #[test]
    fn test_metric_lines_split_idle_and_memory() {
        let busy = Metric::from_raw(Mode::Full, Some(100), false, Some(64)).unwrap();
        let idle = Metric::from_raw(Mode::Full, Some(40), true, Some(-16)).unwrap();
        let node = busy.checked_add(&idle).unwrap();

        let lines = format_metric_lines(&node, Mode::Full);
        assert_eq!(lines, vec!["100,0,64", "40,1,-16"]);

        let back = lines
            .iter()
            .map(|l| parse_sample(&format!("P1;T1 {}", l), Mode::Full).unwrap().metric)
            .try_fold(Metric::default(), |acc, m| acc.checked_add(&m))
            .unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_metric_lines_memory_mode() {
        let m = Metric::from_raw(Mode::Memory, None, false, Some(10))
            .unwrap()
            .checked_add(&Metric::from_raw(Mode::Memory, None, false, Some(-4)).unwrap())
            .unwrap();
        assert_eq!(format_metric_lines(&m, Mode::Memory), vec!["10", "-4"]);
        assert_eq!(format_metric_lines(&Metric::default(), Mode::Memory), vec!["0"]);
        assert_eq!(format_metric_lines(&Metric::wall(5), Mode::Wall), vec!["5"]);
    }
}
