//! Decoding (and encoding) of the MOJO binary trace format.
//!
//! A MOJO stream starts with the magic bytes `MOJ` and a format version, followed by a sequence
//! of events. Every event starts with a one-byte [`Tag`] and carries a tag-specific payload of
//! [varints](varint) and NUL-terminated strings. Frames are interned: the first time the sampler
//! sees a frame it defines it under a numeric key, and from then on stacks refer to that key.
//!
//! [`Decoder`] turns a byte stream into [`Event`]s, and [`Samples`] folds those events into the
//! [`Record`]s the rest of the crate works with.

pub mod varint;

mod writer;

pub use writer::Writer;

use std::collections::VecDeque;
use std::fmt;
use std::io;

use ahash::AHashMap;
use thiserror::Error;

use crate::sample::{Frame, Metrics, Record, Sample};

use self::varint::VarintError;

/// The three bytes every MOJO stream starts with.
pub const MAGIC: &[u8; 3] = b"MOJ";

/// The format version written by default.
pub const VERSION: u32 = 1;

/// The newest format version understood. Version 2 frame definitions carry end line and column
/// information.
pub const MAX_VERSION: u32 = 2;

/// Event tags. The numbering is part of the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Never written; decoding it is an error.
    Reserved = 0,
    /// `key`, `value` strings.
    Metadata = 1,
    /// Start of a stack: `pid` varint, `tid` string.
    Stack = 2,
    /// Frame definition: `key`, `filename`, `scope`, `line` (plus location extras in v2).
    Frame = 3,
    /// A frame that could not be sampled.
    FrameInvalid = 4,
    /// Reference to a previously defined frame: `key`.
    FrameRef = 5,
    /// Native kernel frame: `scope` string.
    FrameKernel = 6,
    /// The garbage collector was running.
    Gc = 7,
    /// The thread was idle.
    Idle = 8,
    /// Time metric: unsigned varint.
    MetricTime = 9,
    /// Memory metric: signed varint.
    MetricMemory = 10,
}

impl Tag {
    /// Map a tag byte to its tag, if it is one.
    pub fn from_u8(byte: u8) -> Option<Tag> {
        Some(match byte {
            0 => Tag::Reserved,
            1 => Tag::Metadata,
            2 => Tag::Stack,
            3 => Tag::Frame,
            4 => Tag::FrameInvalid,
            5 => Tag::FrameRef,
            6 => Tag::FrameKernel,
            7 => Tag::Gc,
            8 => Tag::Idle,
            9 => Tag::MetricTime,
            10 => Tag::MetricMemory,
            _ => return None,
        })
    }
}

/// The kind of value a metric event carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// Microseconds.
    Time,
    /// Bytes, signed.
    Memory,
}

/// Marker frames that have no location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Special {
    /// A frame the sampler failed to read.
    Invalid,
    /// Garbage collection.
    Gc,
}

impl Special {
    /// The label the marker shows up under in call trees.
    pub fn label(self) -> &'static str {
        match self {
            Special::Invalid => "INVALID",
            Special::Gc => "GC",
        }
    }
}

impl fmt::Display for Special {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One decoded MOJO event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A `key: value` pair.
    Metadata {
        /// Metadata name.
        key: String,
        /// Metadata value.
        value: String,
    },
    /// A new stack begins.
    Stack {
        /// Process id.
        pid: u64,
        /// Thread id, as written by the sampler.
        tid: String,
    },
    /// A frame was registered in the intern table.
    FrameDef {
        /// Intern key.
        key: i64,
        /// The frame itself.
        frame: Frame,
    },
    /// The current stack continues with a previously defined frame.
    FrameRef {
        /// Intern key.
        key: i64,
        /// The frame the key resolves to.
        frame: Frame,
    },
    /// The current stack continues with a kernel frame.
    KernelFrame {
        /// Kernel function name.
        scope: String,
    },
    /// The current stack continues with a marker frame.
    SpecialFrame(Special),
    /// A single metric value. Not emitted in full metrics mode.
    Metric {
        /// What the value measures.
        kind: MetricType,
        /// The value.
        value: i64,
    },
    /// The thread was idle. Not emitted in full metrics mode.
    Idle,
    /// The metrics buffered for one sample in full metrics mode.
    FullMetrics {
        /// Time delta.
        time: i64,
        /// Whether an idle event was seen.
        idle: bool,
        /// Memory delta.
        memory: i64,
    },
}

/// Fatal errors while decoding a MOJO stream.
///
/// The format has no redundancy to resynchronize on, so any of these ends the decoding session.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The stream ended in the middle of an event.
    #[error("input truncated inside the event starting at offset {offset}")]
    TruncatedInput {
        /// Offset of the event that could not be completed.
        offset: u64,
    },
    /// The stream is not a MOJO stream, or contains values the format does not allow.
    #[error("invalid MOJO data: {0}")]
    InvalidFormat(String),
    /// A tag byte that is not part of the format.
    #[error("unknown event tag {tag} at offset {offset}")]
    UnknownEvent {
        /// The offending byte.
        tag: u8,
        /// Where it was read.
        offset: u64,
    },
    /// A frame reference to a key that was never defined.
    #[error("reference to undefined frame key {key} at offset {offset}")]
    UnresolvedFrameReference {
        /// The dangling key.
        key: i64,
        /// Offset of the reference event.
        offset: u64,
    },
    /// The underlying reader failed.
    #[error("failed to read MOJO data: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default)]
struct PendingMetrics {
    time: Option<i64>,
    idle: bool,
    memory: Option<i64>,
}

impl PendingMetrics {
    fn is_empty(&self) -> bool {
        self.time.is_none() && !self.idle && self.memory.is_none()
    }
}

/// A streaming MOJO decoder.
///
/// `Decoder` is an iterator of events. It stops cleanly when the input ends exactly at an event
/// boundary and yields an error otherwise; after the first error it yields nothing more and
/// forgets every interned frame.
pub struct Decoder<R> {
    reader: R,

    /// Bytes consumed so far.
    offset: u64,

    /// Where the event being decoded started.
    event_offset: u64,

    version: u32,

    /// Intern table, alive for this session only.
    frames: AHashMap<i64, Frame>,

    /// Set once `mode: full` metadata has been seen.
    full: bool,
    pending: PendingMetrics,

    /// Decoded events not handed out yet.
    ready: VecDeque<Event>,
    done: bool,

    buf: Vec<u8>,
}

impl<R> fmt::Debug for Decoder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("offset", &self.offset)
            .field("version", &self.version)
            .field("frames", &self.frames.len())
            .field("full", &self.full)
            .field("done", &self.done)
            .finish()
    }
}

impl<R> Decoder<R>
where
    R: io::BufRead,
{
    /// Check the stream header and prepare to decode events.
    pub fn new(reader: R) -> Result<Self, DecodeError> {
        let mut decoder = Decoder {
            reader,
            offset: 0,
            event_offset: 0,
            version: 0,
            frames: AHashMap::new(),
            full: false,
            pending: PendingMetrics::default(),
            ready: VecDeque::new(),
            done: false,
            buf: Vec::new(),
        };

        for &expected in MAGIC.iter() {
            match decoder.next_byte()? {
                Some(b) if b == expected => {}
                Some(_) => {
                    return Err(DecodeError::InvalidFormat(
                        "missing MOJ magic bytes".to_string(),
                    ))
                }
                None => {
                    return Err(DecodeError::InvalidFormat(
                        "input too short for a MOJ header".to_string(),
                    ))
                }
            }
        }

        let version = decoder.read_int().map_err(|e| match e {
            DecodeError::TruncatedInput { .. } => {
                DecodeError::InvalidFormat("missing format version".to_string())
            }
            e => e,
        })?;
        decoder.version = match u32::try_from(version) {
            Ok(v) if (1..=MAX_VERSION).contains(&v) => v,
            _ => {
                return Err(DecodeError::InvalidFormat(format!(
                    "unsupported format version {}",
                    version
                )))
            }
        };
        debug!("decoding MOJO stream, version {}", decoder.version);

        Ok(decoder)
    }

    /// The format version declared in the header.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether full metrics mode has been switched on.
    pub fn is_full_mode(&self) -> bool {
        self.full
    }

    /// How many bytes have been consumed, header included.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Wrap this decoder into one that yields [`Record`]s.
    pub fn samples(self) -> Samples<R> {
        Samples::from(self)
    }

    fn next_byte(&mut self) -> Result<Option<u8>, DecodeError> {
        let byte = loop {
            match self.reader.fill_buf() {
                Ok(buf) => break buf.first().copied(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if byte.is_some() {
            self.reader.consume(1);
            self.offset += 1;
        }
        Ok(byte)
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        match self.next_byte()? {
            Some(b) => Ok(b),
            None => Err(DecodeError::TruncatedInput {
                offset: self.event_offset,
            }),
        }
    }

    fn read_int(&mut self) -> Result<i64, DecodeError> {
        let start = self.offset;
        varint::read_with(|| self.read_byte()).map_err(|e| match e {
            DecodeError::InvalidFormat(_) => {
                DecodeError::InvalidFormat(format!("integer at offset {} overflows", start))
            }
            e => e,
        })
    }

    fn read_u32(&mut self, what: &str) -> Result<u32, DecodeError> {
        let start = self.offset;
        let n = self.read_int()?;
        u32::try_from(n).map_err(|_| {
            DecodeError::InvalidFormat(format!("{} {} at offset {} out of range", what, n, start))
        })
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        self.buf.clear();
        let n = loop {
            match self.reader.read_until(0, &mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.offset += n as u64;
        if self.buf.pop() != Some(0) {
            return Err(DecodeError::TruncatedInput {
                offset: self.event_offset,
            });
        }
        Ok(String::from_utf8_lossy(&self.buf).into_owned())
    }

    fn flush_metrics(&mut self) {
        if !self.full || self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        self.ready.push_back(Event::FullMetrics {
            time: pending.time.unwrap_or(0),
            idle: pending.idle,
            memory: pending.memory.unwrap_or(0),
        });
    }

    /// Decode the next event into `self.ready`. Returns `false` at a clean end of input.
    fn step(&mut self) -> Result<bool, DecodeError> {
        self.event_offset = self.offset;
        let byte = match self.next_byte()? {
            Some(b) => b,
            None => return Ok(false),
        };
        let unknown = DecodeError::UnknownEvent {
            tag: byte,
            offset: self.event_offset,
        };
        let tag = match Tag::from_u8(byte) {
            Some(tag) => tag,
            None => return Err(unknown),
        };
        trace!("event {:?} at offset {}", tag, self.event_offset);

        match tag {
            Tag::Reserved => return Err(unknown),
            Tag::Metadata => {
                self.flush_metrics();
                let key = self.read_string()?;
                let value = self.read_string()?;
                if key == "mode" && value == "full" {
                    self.full = true;
                }
                self.ready.push_back(Event::Metadata { key, value });
            }
            Tag::Stack => {
                self.flush_metrics();
                let pid = self.read_int()?;
                let pid = u64::try_from(pid).map_err(|_| {
                    DecodeError::InvalidFormat(format!(
                        "negative process id {} at offset {}",
                        pid, self.event_offset
                    ))
                })?;
                let tid = self.read_string()?;
                self.ready.push_back(Event::Stack { pid, tid });
            }
            Tag::Frame => {
                let key = self.read_int()?;
                let filename = self.read_string()?;
                let scope = self.read_string()?;
                let line = self.read_u32("line")?;
                let mut frame = Frame::new(scope, filename, line);
                if self.version >= 2 {
                    frame.line_end = self.read_u32("end line")?;
                    frame.column = self.read_u32("column")?;
                    frame.column_end = self.read_u32("end column")?;
                }
                self.frames.insert(key, frame.clone());
                self.ready.push_back(Event::FrameDef { key, frame });
            }
            Tag::FrameInvalid => {
                self.ready.push_back(Event::SpecialFrame(Special::Invalid));
            }
            Tag::FrameRef => {
                let key = self.read_int()?;
                let frame = match self.frames.get(&key) {
                    Some(frame) => frame.clone(),
                    None => {
                        return Err(DecodeError::UnresolvedFrameReference {
                            key,
                            offset: self.event_offset,
                        })
                    }
                };
                self.ready.push_back(Event::FrameRef { key, frame });
            }
            Tag::FrameKernel => {
                let scope = self.read_string()?;
                self.ready.push_back(Event::KernelFrame { scope });
            }
            Tag::Gc => {
                self.ready.push_back(Event::SpecialFrame(Special::Gc));
            }
            Tag::Idle => {
                if self.full {
                    self.pending.idle = true;
                } else {
                    self.ready.push_back(Event::Idle);
                }
            }
            Tag::MetricTime | Tag::MetricMemory => {
                let value = self.read_int()?;
                let kind = if tag == Tag::MetricTime {
                    MetricType::Time
                } else {
                    MetricType::Memory
                };
                if self.full {
                    match kind {
                        MetricType::Time => self.pending.time = Some(value),
                        MetricType::Memory => self.pending.memory = Some(value),
                    }
                } else {
                    self.ready.push_back(Event::Metric { kind, value });
                }
            }
        }

        Ok(true)
    }
}

impl<R> Iterator for Decoder<R>
where
    R: io::BufRead,
{
    type Item = Result<Event, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            match self.step() {
                Ok(true) => {}
                Ok(false) => {
                    self.flush_metrics();
                    self.done = true;
                    debug!("MOJO stream ended cleanly after {} bytes", self.offset);
                }
                Err(e) => {
                    self.done = true;
                    self.frames.clear();
                    self.ready.clear();
                    self.pending = PendingMetrics::default();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl From<VarintError> for DecodeError {
    fn from(e: VarintError) -> Self {
        match e {
            // read_byte never lets this through; it reports truncation itself
            VarintError::Truncated => DecodeError::InvalidFormat("truncated integer".to_string()),
            VarintError::Overflow => DecodeError::InvalidFormat("integer overflow".to_string()),
        }
    }
}

/// Folds decoded MOJO events into [`Record`]s.
///
/// A stack event opens a sample, frame references, kernel frames and marker frames extend it, and
/// the metric that follows (or the combined metrics in full mode) closes it. Frame definitions
/// produce nothing by themselves.
///
/// Thread ids are written by samplers in hex and come out in decimal, as collapsed lines have them.
#[derive(Debug)]
pub struct Samples<R> {
    events: Decoder<R>,
    current: Option<Sample>,
}

impl<R> From<Decoder<R>> for Samples<R> {
    fn from(events: Decoder<R>) -> Self {
        Samples {
            events,
            current: None,
        }
    }
}

impl<R> Samples<R>
where
    R: io::BufRead,
{
    /// Check the stream header and prepare to decode samples.
    pub fn new(reader: R) -> Result<Self, DecodeError> {
        Ok(Decoder::new(reader)?.samples())
    }

    /// The underlying event decoder.
    pub fn decoder(&self) -> &Decoder<R> {
        &self.events
    }

    fn push(&mut self, frame: Frame) {
        match self.current {
            Some(ref mut sample) => sample.frames.push(frame),
            None => warn!(
                "Ignoring frame {} outside of a stack (offset {})",
                frame.label(),
                self.events.offset()
            ),
        }
    }

    fn close(&mut self, metrics: Metrics) -> Option<Sample> {
        let mut sample = match self.current.take() {
            Some(sample) => sample,
            None => {
                warn!(
                    "Ignoring metrics outside of a stack (offset {})",
                    self.events.offset()
                );
                return None;
            }
        };
        sample.metrics = metrics;
        Some(sample)
    }
}

// Samplers write thread ids in hex, collapsed lines carry them in decimal. Anything that does not
// read as hex is kept as is.
fn decimal_tid(tid: String) -> String {
    let digits = tid
        .strip_prefix("0x")
        .or_else(|| tid.strip_prefix("0X"))
        .unwrap_or(&tid);
    match u64::from_str_radix(digits, 16) {
        Ok(n) => itoa::Buffer::new().format(n).to_string(),
        Err(_) => tid,
    }
}

impl<R> Iterator for Samples<R>
where
    R: io::BufRead,
{
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let event = match self.events.next() {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    self.current = None;
                    return Some(Err(e));
                }
                None => {
                    if let Some(sample) = self.current.take() {
                        warn!("Dropping stack of thread {} with no metrics", sample.tid);
                    }
                    return None;
                }
            };

            let metrics = match event {
                Event::Metadata { key, value } => {
                    return Some(Ok(Record::Metadata { key, value }));
                }
                Event::Stack { pid, tid } => {
                    let sample = Sample {
                        pid: Some(pid),
                        tid: decimal_tid(tid),
                        frames: Vec::new(),
                        metrics: Metrics::Single(0),
                    };
                    if let Some(previous) = self.current.replace(sample) {
                        warn!("Dropping stack of thread {} with no metrics", previous.tid);
                    }
                    continue;
                }
                Event::FrameDef { .. } | Event::Idle => continue,
                Event::FrameRef { frame, .. } => {
                    self.push(frame);
                    continue;
                }
                Event::KernelFrame { scope } => {
                    self.push(Frame::kernel(scope));
                    continue;
                }
                Event::SpecialFrame(special) => {
                    self.push(Frame::special(special.label()));
                    continue;
                }
                Event::Metric { value, .. } => Metrics::Single(value),
                Event::FullMetrics { time, idle, memory } => Metrics::Full {
                    time: time.max(0) as u64,
                    idle,
                    memory,
                },
            };

            if let Some(sample) = self.close(metrics) {
                return Some(Ok(Record::Sample(sample)));
            }
        }
    }
}
