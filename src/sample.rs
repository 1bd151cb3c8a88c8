use std::fmt;

/// One position on a sampled call stack.
///
/// Frames are immutable once decoded. Two frames fold into the same call tree node when their
/// [`label`](Frame::label)s are equal, which deliberately ignores the line number: the same
/// function reached from different lines shows up as a single node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Frame {
    /// Function (or qualified) name.
    pub scope: String,
    /// Source file. Empty for bare label frames such as `GC`.
    pub filename: String,
    /// Line number, 0 when unknown.
    pub line: u32,
    /// Last line of the executing expression, 0 when unknown.
    pub line_end: u32,
    /// Starting column, 0 when unknown.
    pub column: u32,
    /// Ending column, 0 when unknown.
    pub column_end: u32,
}

/// Filename given to frames that come from the kernel.
pub const KERNEL_FILENAME: &str = "kernel";

impl Frame {
    /// A frame with only the basic location information.
    pub fn new<S, F>(scope: S, filename: F, line: u32) -> Self
    where
        S: Into<String>,
        F: Into<String>,
    {
        Frame {
            scope: scope.into(),
            filename: filename.into(),
            line,
            ..Default::default()
        }
    }

    /// A native kernel frame.
    pub fn kernel<S: Into<String>>(scope: S) -> Self {
        Frame::new(scope, KERNEL_FILENAME, 0)
    }

    /// A marker frame such as `GC` or `INVALID` that has no location.
    pub fn special<S: Into<String>>(label: S) -> Self {
        Frame::new(label, "", 0)
    }

    /// Whether this frame carries no location, only a label.
    pub fn is_bare(&self) -> bool {
        self.filename.is_empty()
    }

    /// The name two frames are compared by when merged into a call tree.
    pub fn label(&self) -> String {
        if self.is_bare() {
            self.scope.clone()
        } else {
            format!("{} ({})", self.scope, self.filename)
        }
    }
}

/// The scalar a call tree aggregates out of a sample's metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Elapsed time in microseconds.
    #[default]
    WallTime,
    /// Elapsed time of samples that were not idle.
    CpuTime,
    /// Bytes allocated.
    MemoryAlloc,
    /// Bytes released.
    MemoryDealloc,
}

impl MetricKind {
    /// The unit values of this kind are expressed in.
    pub fn unit(self) -> &'static str {
        match self {
            MetricKind::WallTime | MetricKind::CpuTime => "microseconds",
            MetricKind::MemoryAlloc | MetricKind::MemoryDealloc => "bytes",
        }
    }
}

/// The metric(s) that came with a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metrics {
    /// A single value. Whether it is a time or a memory delta depends on the sampler's mode.
    Single(i64),
    /// The bundle written in full metrics mode.
    Full {
        /// Elapsed time in microseconds.
        time: u64,
        /// Whether the thread was idle.
        idle: bool,
        /// Memory delta in bytes; negative when memory was released.
        memory: i64,
    },
}

impl Metrics {
    /// Extract the value of the given kind.
    pub fn value(&self, kind: MetricKind) -> u64 {
        match *self {
            Metrics::Single(v) => match kind {
                MetricKind::WallTime | MetricKind::CpuTime | MetricKind::MemoryAlloc => {
                    positive(v)
                }
                MetricKind::MemoryDealloc => positive(v.saturating_neg()),
            },
            Metrics::Full { time, idle, memory } => match kind {
                MetricKind::WallTime => time,
                MetricKind::CpuTime if idle => 0,
                MetricKind::CpuTime => time,
                MetricKind::MemoryAlloc => positive(memory),
                MetricKind::MemoryDealloc => positive(memory.saturating_neg()),
            },
        }
    }

    /// Whether the sampler flagged the thread as idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Metrics::Full { idle: true, .. })
    }

    /// Whether these metrics were written in full metrics mode.
    pub fn is_full(&self) -> bool {
        matches!(self, Metrics::Full { .. })
    }
}

fn positive(v: i64) -> u64 {
    if v > 0 {
        v as u64
    } else {
        0
    }
}

/// One observation of a thread's call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Process the thread belongs to, if the source reports it.
    pub pid: Option<u64>,
    /// Thread identifier, verbatim from the source.
    pub tid: String,
    /// Frames from the outermost call to the innermost one. Empty for an idle or empty thread.
    pub frames: Vec<Frame>,
    /// What was measured since the previous sample.
    pub metrics: Metrics,
}

impl Sample {
    /// The key this sample's thread is aggregated under.
    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey::new(self.pid, &self.tid)
    }
}

/// Anything a decoder can hand to the aggregation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// A `key: value` pair emitted by the sampler.
    Metadata {
        /// Metadata name, e.g. `mode` or `map`.
        key: String,
        /// Uninterpreted value.
        value: String,
    },
    /// A stack sample.
    Sample(Sample),
}

/// Identity of a sampled thread: `P<pid>:T<tid>`, or `T<tid>` when the process is unknown.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadKey(String);

impl ThreadKey {
    /// Build the key for a thread.
    pub fn new(pid: Option<u64>, tid: &str) -> Self {
        match pid {
            Some(pid) => ThreadKey(format!("P{}:T{}", pid, tid)),
            None => ThreadKey(format!("T{}", tid)),
        }
    }

    /// The key as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadKey {
    fn from(key: &str) -> Self {
        ThreadKey(key.to_string())
    }
}

impl From<String> for ThreadKey {
    fn from(key: String) -> Self {
        ThreadKey(key)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
