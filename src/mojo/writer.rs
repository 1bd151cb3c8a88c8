use std::io::{self, Write};

use super::{varint, Tag, MAGIC, MAX_VERSION, VERSION};
use crate::sample::Frame;

/// Writes MOJO events.
///
/// This mirrors what a sampler emits and is what the decoder is tested and benchmarked against.
#[derive(Debug)]
pub struct Writer<W: Write> {
    writer: W,
    version: u32,
}

impl<W: Write> Writer<W> {
    /// Start a stream in the default format version.
    pub fn new(writer: W) -> io::Result<Self> {
        Writer::with_version(writer, VERSION)
    }

    /// Start a stream in the given format version.
    pub fn with_version(mut writer: W, version: u32) -> io::Result<Self> {
        if !(1..=MAX_VERSION).contains(&version) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot write MOJO version {}", version),
            ));
        }
        writer.write_all(MAGIC)?;
        varint::write(&mut writer, i64::from(version))?;
        Ok(Writer { writer, version })
    }

    fn tag(&mut self, tag: Tag) -> io::Result<()> {
        self.writer.write_all(&[tag as u8])
    }

    fn int(&mut self, value: i64) -> io::Result<()> {
        varint::write(&mut self.writer, value).map(|_| ())
    }

    fn string(&mut self, s: &str) -> io::Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "MOJO strings cannot contain NUL bytes",
            ));
        }
        self.writer.write_all(s.as_bytes())?;
        self.writer.write_all(&[0])
    }

    /// A `key: value` metadata pair.
    pub fn metadata(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.tag(Tag::Metadata)?;
        self.string(key)?;
        self.string(value)
    }

    /// Start a new stack.
    pub fn stack(&mut self, pid: u64, tid: &str) -> io::Result<()> {
        let pid = i64::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process id too large"))?;
        self.tag(Tag::Stack)?;
        self.int(pid)?;
        self.string(tid)
    }

    /// Define a frame under `key`.
    pub fn frame(&mut self, key: i64, frame: &Frame) -> io::Result<()> {
        self.tag(Tag::Frame)?;
        self.int(key)?;
        self.string(&frame.filename)?;
        self.string(&frame.scope)?;
        self.int(i64::from(frame.line))?;
        if self.version >= 2 {
            self.int(i64::from(frame.line_end))?;
            self.int(i64::from(frame.column))?;
            self.int(i64::from(frame.column_end))?;
        }
        Ok(())
    }

    /// Continue the current stack with the frame defined under `key`.
    pub fn frame_ref(&mut self, key: i64) -> io::Result<()> {
        self.tag(Tag::FrameRef)?;
        self.int(key)
    }

    /// Continue the current stack with a kernel frame.
    pub fn kernel_frame(&mut self, scope: &str) -> io::Result<()> {
        self.tag(Tag::FrameKernel)?;
        self.string(scope)
    }

    /// Continue the current stack with an invalid frame marker.
    pub fn invalid_frame(&mut self) -> io::Result<()> {
        self.tag(Tag::FrameInvalid)
    }

    /// Mark the current stack as collecting garbage.
    pub fn gc(&mut self) -> io::Result<()> {
        self.tag(Tag::Gc)
    }

    /// Mark the current stack as idle.
    pub fn idle(&mut self) -> io::Result<()> {
        self.tag(Tag::Idle)
    }

    /// A time metric.
    pub fn time(&mut self, value: u64) -> io::Result<()> {
        let value = i64::try_from(value)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "time metric too large"))?;
        self.tag(Tag::MetricTime)?;
        self.int(value)
    }

    /// A memory metric; negative values are releases.
    pub fn memory(&mut self, value: i64) -> io::Result<()> {
        self.tag(Tag::MetricMemory)?;
        self.int(value)
    }

    /// The metrics of one sample in full metrics mode, in the order samplers write them.
    pub fn full_metrics(&mut self, time: u64, idle: bool, memory: i64) -> io::Result<()> {
        self.time(time)?;
        if idle {
            self.idle()?;
        }
        self.memory(memory)
    }

    /// Flush and give back the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
