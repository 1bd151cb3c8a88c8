//! [Speedscope](https://www.speedscope.app) files.
//!
//! Every thread gets a sampled time profile. Threads sampled in full metrics mode also get a
//! memory allocation and a memory release profile. All profiles share one frame table.
//!
//! ```
//! use ember::export::speedscope::Builder;
//! use ember::sample::{Frame, Metrics, Sample};
//!
//! let mut builder = Builder::new("example");
//! builder.add_sample(&Sample {
//!     pid: Some(42),
//!     tid: "7".to_string(),
//!     frames: vec![Frame::new("main", "app.py", 3)],
//!     metrics: Metrics::Single(1000),
//! });
//! let file = builder.build();
//! assert_eq!(file.profiles.len(), 1);
//! assert_eq!(file.profiles[0].name, "Time profile of P42:T7");
//! ```

use std::io;

use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::Serialize;

use crate::error::Result;
use crate::sample::{Frame, MetricKind, Record, Sample, ThreadKey};

/// Where the speedscope file format is specified.
pub const SCHEMA: &str = "https://www.speedscope.app/file-format-schema.json";

/// A complete speedscope file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct File {
    /// Always [`SCHEMA`].
    #[serde(rename = "$schema")]
    pub schema: &'static str,
    /// Tables shared by all profiles.
    pub shared: Shared,
    /// One profile per thread and metric, sorted by thread.
    pub profiles: Vec<Profile>,
    /// Name of the whole file.
    pub name: String,
    /// What produced the file.
    pub exporter: String,
}

/// Tables shared by all profiles.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Shared {
    /// Every distinct frame, indexed by the profiles' samples.
    pub frames: Vec<SharedFrame>,
}

/// A frame in the shared table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SharedFrame {
    /// Function name.
    pub name: String,
    /// Source file, absent for marker frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Line number, absent for marker frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// A sampled profile of one metric of one thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Profile {
    /// Always `sampled`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Which metric of which thread this is.
    pub name: String,
    /// Unit of the weights.
    pub unit: &'static str,
    /// Always 0.
    #[serde(rename = "startValue")]
    pub start_value: u64,
    /// Sum of the weights.
    #[serde(rename = "endValue")]
    pub end_value: u64,
    /// Stacks as indices into the shared frame table, outermost frame first.
    pub samples: Vec<Vec<usize>>,
    /// Weight of each stack in `samples`.
    pub weights: Vec<u64>,
}

impl Profile {
    fn new(thread: &ThreadKey, kind: MetricKind) -> Self {
        let what = match kind {
            MetricKind::WallTime | MetricKind::CpuTime => "Time",
            MetricKind::MemoryAlloc => "Memory allocation",
            MetricKind::MemoryDealloc => "Memory release",
        };
        Profile {
            kind: "sampled",
            name: format!("{} profile of {}", what, thread),
            unit: kind.unit(),
            start_value: 0,
            end_value: 0,
            samples: Vec::new(),
            weights: Vec::new(),
        }
    }

    fn push(&mut self, stack: Vec<usize>, weight: u64) {
        self.end_value = self.end_value.saturating_add(weight);
        self.samples.push(stack);
        self.weights.push(weight);
    }
}

/// Accumulates samples into a speedscope [`File`].
#[derive(Debug)]
pub struct Builder {
    name: String,
    frames: IndexMap<String, SharedFrame>,
    profiles: IndexMap<(ThreadKey, MetricKind), Profile>,
}

impl Builder {
    /// Start a file with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Builder {
            name: name.into(),
            frames: IndexMap::new(),
            profiles: IndexMap::new(),
        }
    }

    fn frame_index(&mut self, frame: &Frame) -> usize {
        let id = format!("{}@{}:{}", frame.scope, frame.filename, frame.line);
        let entry = self.frames.entry(id);
        let index = entry.index();
        if let Entry::Vacant(slot) = entry {
            slot.insert(if frame.is_bare() {
                SharedFrame {
                    name: frame.scope.clone(),
                    file: None,
                    line: None,
                }
            } else {
                SharedFrame {
                    name: frame.scope.clone(),
                    file: Some(frame.filename.clone()),
                    line: Some(frame.line),
                }
            });
        }
        index
    }

    fn profile(&mut self, thread: &ThreadKey, kind: MetricKind) -> &mut Profile {
        self.profiles
            .entry((thread.clone(), kind))
            .or_insert_with(|| Profile::new(thread, kind))
    }

    /// Add a sample to its thread's profiles.
    ///
    /// Memory profiles only receive samples that allocated or released something.
    pub fn add_sample(&mut self, sample: &Sample) {
        let stack: Vec<usize> = sample
            .frames
            .iter()
            .map(|frame| self.frame_index(frame))
            .collect();
        let thread = sample.thread_key();

        let time = sample.metrics.value(MetricKind::WallTime);
        if !sample.metrics.is_full() {
            self.profile(&thread, MetricKind::WallTime).push(stack, time);
            return;
        }

        let alloc = sample.metrics.value(MetricKind::MemoryAlloc);
        let dealloc = sample.metrics.value(MetricKind::MemoryDealloc);
        self.profile(&thread, MetricKind::WallTime)
            .push(stack.clone(), time);
        let allocs = self.profile(&thread, MetricKind::MemoryAlloc);
        if alloc != 0 {
            allocs.push(stack.clone(), alloc);
        }
        let releases = self.profile(&thread, MetricKind::MemoryDealloc);
        if dealloc != 0 {
            releases.push(stack, dealloc);
        }
    }

    /// Add a record. Metadata is ignored.
    pub fn add_record(&mut self, record: &Record) {
        if let Record::Sample(sample) = record {
            self.add_sample(sample);
        }
    }

    /// Finish the file, with profiles sorted by thread.
    pub fn build(self) -> File {
        let mut profiles: Vec<_> = self.profiles.into_iter().collect();
        // stable, so each thread's profiles stay in the order they were created
        profiles.sort_by(|((a, _), _), ((b, _), _)| a.cmp(b));
        File {
            schema: SCHEMA,
            shared: Shared {
                frames: self.frames.into_values().collect(),
            },
            profiles: profiles.into_iter().map(|(_, profile)| profile).collect(),
            name: self.name,
            exporter: format!("ember {}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Finish the file and write it as JSON.
    pub fn write<W: io::Write>(self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, &self.build())?;
        Ok(())
    }
}
