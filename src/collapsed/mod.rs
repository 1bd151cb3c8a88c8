//! The textual collapsed-stack format.
//!
//! Each line is either a sample or a metadata entry:
//!
//! ```text
//! # mode: wall
//! P4242;T7;<module> (app.py:L1);main (app.py:L12);work (lib.py:L40) 1520
//! P4242;T8 1000
//! T7;main (app.py:L12);GC 310,0,-2048
//! ```
//!
//! A sample starts with the thread header (`T<tid>`, optionally preceded by `P<pid>;`), continues
//! with its frames from the outermost to the innermost, and ends with a space and either a single
//! metric or the `time,idle,memory` triple written in full metrics mode. A thread with no frames
//! has just the header and the metric.
//!
//! Frames are written as `scope (filename:Lline)`. A frame without a parenthesized location, such
//! as the `GC` marker, is a bare label. Metadata lines look like `# key: value`; the `# map:`
//! entries carrying memory maps are passed through as-is.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::error::Error;
use crate::sample::{Frame, Metrics, Record, Sample};

/// A line that is not a valid sample or metadata entry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("malformed line {line}: {reason}: {text:?}")]
pub struct MalformedLine {
    /// 1-based line number, or 0 when the line was parsed on its own.
    pub line: usize,
    /// What is wrong with it.
    pub reason: &'static str,
    /// The offending line.
    pub text: String,
}

impl MalformedLine {
    fn new(reason: &'static str, text: &str) -> Self {
        MalformedLine {
            line: 0,
            reason,
            text: text.to_string(),
        }
    }
}

/// Parse a single line.
///
/// Trailing line terminators are ignored. Blank lines are not records and are reported as
/// malformed; [`Reader`] skips them before they get here.
pub fn parse_line(line: &str) -> Result<Record, MalformedLine> {
    let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
    if let Some(meta) = line.strip_prefix('#') {
        let (key, value) = meta
            .split_once(':')
            .ok_or_else(|| MalformedLine::new("metadata without a key", line))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(MalformedLine::new("metadata without a key", line));
        }
        return Ok(Record::Metadata {
            key: key.to_string(),
            value: value.trim_start().to_string(),
        });
    }

    let split = line
        .rfind(|c: char| c.is_ascii_whitespace())
        .ok_or_else(|| MalformedLine::new("no metrics", line))?;
    let metrics = parse_metrics(&line[(split + 1)..])
        .ok_or_else(|| MalformedLine::new("invalid metrics", line))?;
    let stack = line[..split].trim_end();

    let mut parts = stack.split(';');
    let head = parts.next().unwrap_or_default();
    let (pid, tid) = match head.strip_prefix('P') {
        Some(pid) => {
            let pid = pid
                .parse::<u64>()
                .map_err(|_| MalformedLine::new("invalid process id", line))?;
            let tid = parts
                .next()
                .and_then(|t| t.strip_prefix('T'))
                .ok_or_else(|| MalformedLine::new("missing thread id", line))?;
            (Some(pid), tid)
        }
        None => {
            let tid = head
                .strip_prefix('T')
                .ok_or_else(|| MalformedLine::new("missing thread id", line))?;
            (None, tid)
        }
    };
    if tid.is_empty() {
        return Err(MalformedLine::new("missing thread id", line));
    }

    let frames = parts
        .map(|token| parse_frame(token).ok_or_else(|| MalformedLine::new("invalid frame", line)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Record::Sample(Sample {
        pid,
        tid: tid.to_string(),
        frames,
        metrics,
    }))
}

fn parse_metrics(s: &str) -> Option<Metrics> {
    let mut values = s.split(',');
    let first = values.next()?;
    match (values.next(), values.next(), values.next()) {
        (None, _, _) => first.parse().ok().map(Metrics::Single),
        (Some(idle), Some(memory), None) => Some(Metrics::Full {
            time: first.parse().ok()?,
            idle: match idle {
                "0" => false,
                "1" => true,
                _ => return None,
            },
            memory: memory.parse().ok()?,
        }),
        _ => None,
    }
}

// A frame token is `scope (filename:Lline)`. The scope ends at the first whitespace, so anything
// that does not continue with a parenthesized location is taken as a bare label.
fn parse_frame(token: &str) -> Option<Frame> {
    if token.is_empty() {
        return None;
    }

    let location = token
        .split_once(|c: char| c.is_ascii_whitespace())
        .and_then(|(scope, rest)| {
            let rest = rest.trim_start();
            let location = rest.strip_prefix('(')?.strip_suffix(')')?;
            Some((scope, location))
        });
    let (scope, location) = match location {
        Some(parts) => parts,
        None => return Some(Frame::special(token)),
    };

    let (filename, line) = location.rsplit_once(':')?;
    // a single leading marker, `L` as austin writes it
    let line = match line.chars().next() {
        Some(marker) if !marker.is_ascii_digit() => &line[marker.len_utf8()..],
        _ => line,
    };
    let line = line.parse().ok()?;
    if filename.is_empty() {
        return None;
    }
    Some(Frame::new(scope, filename, line))
}

/// Render a record as a single line, without the line terminator.
///
/// Any line accepted by [`parse_line`] comes back unchanged, with two normalizations: line
/// numbers always get the `L` marker, whichever one they came with, and runs of whitespace inside frame tokens and before the
/// metrics collapse to a single space.
pub fn format_record(record: &Record) -> String {
    let mut out = String::new();
    match record {
        Record::Metadata { key, value } => {
            out.push_str("# ");
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
        }
        Record::Sample(sample) => format_sample(&mut out, sample),
    }
    out
}

fn format_sample(out: &mut String, sample: &Sample) {
    let mut int = itoa::Buffer::new();
    if let Some(pid) = sample.pid {
        out.push('P');
        out.push_str(int.format(pid));
        out.push(';');
    }
    out.push('T');
    out.push_str(&sample.tid);

    for frame in &sample.frames {
        out.push(';');
        out.push_str(&frame.scope);
        if !frame.is_bare() {
            out.push_str(" (");
            out.push_str(&frame.filename);
            out.push_str(":L");
            out.push_str(int.format(frame.line));
            out.push(')');
        }
    }

    out.push(' ');
    match sample.metrics {
        Metrics::Single(v) => out.push_str(int.format(v)),
        Metrics::Full { time, idle, memory } => {
            out.push_str(int.format(time));
            out.push_str(if idle { ",1," } else { ",0," });
            out.push_str(int.format(memory));
        }
    }
}

/// Write a record as a line.
pub fn write_record<W: io::Write>(mut writer: W, record: &Record) -> io::Result<()> {
    let mut line = format_record(record);
    line.push('\n');
    writer.write_all(line.as_bytes())
}

/// How to treat lines that fail to parse.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Stop at the first malformed line with an error, rather than logging and skipping it.
    ///
    /// Default is `false`.
    pub strict: bool,
}

/// Reads records out of a stream of collapsed lines.
///
/// Blank lines are skipped. What happens to malformed lines depends on [`Options::strict`].
pub struct Reader<R> {
    reader: R,
    opt: Options,
    buf: Vec<u8>,
    lineno: usize,
    skipped: usize,
    done: bool,
}

impl<R> fmt::Debug for Reader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("opt", &self.opt)
            .field("lineno", &self.lineno)
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl<R> Reader<R>
where
    R: io::BufRead,
{
    /// Read from `reader` with the given options.
    pub fn new(reader: R, opt: Options) -> Self {
        Reader {
            reader,
            opt,
            buf: Vec::new(),
            lineno: 0,
            skipped: 0,
            done: false,
        }
    }

    /// How many malformed lines have been skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// How many lines have been read so far.
    pub fn lines(&self) -> usize {
        self.lineno
    }
}

impl<R> Iterator for Reader<R>
where
    R: io::BufRead,
{
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    if self.skipped != 0 {
                        warn!("Ignored {} lines with invalid format", self.skipped);
                    }
                }
                Ok(_) => {
                    self.lineno += 1;
                    let line = String::from_utf8_lossy(&self.buf);
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_line(&line) {
                        Ok(record) => return Some(Ok(record)),
                        Err(mut e) => {
                            e.line = self.lineno;
                            if self.opt.strict {
                                self.done = true;
                                return Some(Err(e.into()));
                            }
                            warn!("Skipping line {}: {}", self.lineno, e.reason);
                            self.skipped += 1;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}
