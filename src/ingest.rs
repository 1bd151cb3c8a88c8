//! Getting samples from a stream into a [`Store`].
//!
//! [`open`] detects whether a stream holds collapsed text or binary MOJO, and yields its records.
//! [`feed`] is the producer loop that pushes records into a store until the stream ends, and
//! [`Session`] runs that loop on a thread of its own while consumers read the store.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::collapsed;
use crate::error::{Error, Result};
use crate::mojo;
use crate::sample::Record;
use crate::store::Store;

/// The encodings samples can arrive in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Collapsed stack lines.
    Collapsed,
    /// The binary MOJO format.
    Mojo,
}

impl Format {
    /// Guess the format from the first bytes of a stream.
    ///
    /// An empty stream is taken to be (empty) collapsed text. Returns `None` when the prefix looks
    /// like neither format.
    pub fn guess(prefix: &[u8]) -> Option<Format> {
        // a short read may cut the magic
        if !prefix.is_empty()
            && (prefix.starts_with(mojo::MAGIC) || mojo::MAGIC.starts_with(prefix))
        {
            return Some(Format::Mojo);
        }
        match prefix.iter().find(|b| !b.is_ascii_whitespace()) {
            None | Some(b'#') | Some(b'P') | Some(b'T') => Some(Format::Collapsed),
            Some(_) => None,
        }
    }

    /// Peek at the start of `reader` and guess its format, without consuming anything.
    pub fn detect<R: io::BufRead>(reader: &mut R) -> Result<Format> {
        let prefix = reader.fill_buf()?;
        let format = Format::guess(prefix).ok_or(Error::UnknownFormat)?;
        debug!("Detected {:?} input", format);
        Ok(format)
    }
}

/// Records from any supported format.
pub type Records<'a> = Box<dyn Iterator<Item = Result<Record>> + Send + 'a>;

/// Decode the records of a stream in a known format.
///
/// `opt` only applies to collapsed text. A MOJO stream with a bad header fails right away.
pub fn records<'a, R>(reader: R, format: Format, opt: collapsed::Options) -> Result<Records<'a>>
where
    R: io::BufRead + Send + 'a,
{
    Ok(match format {
        Format::Collapsed => Box::new(collapsed::Reader::new(reader, opt)),
        Format::Mojo => Box::new(mojo::Samples::new(reader)?.map(|r| r.map_err(Error::from))),
    })
}

/// Detect the format of a stream and decode its records.
pub fn open<'a, R>(mut reader: R, opt: collapsed::Options) -> Result<Records<'a>>
where
    R: io::BufRead + Send + 'a,
{
    let format = Format::detect(&mut reader)?;
    records(reader, format, opt)
}

/// Detect the format of a file, or of STDIN if no path is given, and decode its records.
pub fn open_file<P>(infile: Option<P>, opt: collapsed::Options) -> Result<Records<'static>>
where
    P: AsRef<Path>,
{
    match infile {
        Some(path) => {
            let file = File::open(path)?;
            open(io::BufReader::with_capacity(CAPACITY, file), opt)
        }
        None => open(io::BufReader::with_capacity(CAPACITY, io::stdin()), opt),
    }
}

const CAPACITY: usize = 128 * 1024;

/// What a producer loop went through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Samples ingested.
    pub samples: u64,
    /// Metadata entries recorded.
    pub metadata: u64,
}

/// Push records into `store` until they run out.
///
/// The first error stops the loop and is returned. Whatever was ingested before it stays in the
/// store.
pub fn feed<I>(records: I, store: &Store) -> Result<Summary>
where
    I: IntoIterator<Item = Result<Record>>,
{
    feed_with(records, store, || {})
}

fn feed_with<I, F>(records: I, store: &Store, mut on_first_sample: F) -> Result<Summary>
where
    I: IntoIterator<Item = Result<Record>>,
    F: FnMut(),
{
    let mut summary = Summary::default();
    for record in records {
        let record = record?;
        store.record(&record);
        match record {
            Record::Sample(_) => {
                if summary.samples == 0 {
                    on_first_sample();
                }
                summary.samples += 1;
            }
            Record::Metadata { .. } => summary.metadata += 1,
        }
    }
    Ok(summary)
}

#[cfg(feature = "multithreaded")]
pub use self::session::Session;

#[cfg(feature = "multithreaded")]
mod session {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

    use super::{feed_with, Summary};
    use crate::error::Result;
    use crate::sample::Record;
    use crate::store::Store;

    /// A producer loop running on its own thread.
    ///
    /// The store is shared, so consumers can take snapshots while samples keep coming in.
    #[derive(Debug)]
    pub struct Session {
        store: Arc<Store>,
        first: Receiver<()>,
        started: AtomicBool,
        handle: thread::JoinHandle<Result<Summary>>,
    }

    impl Session {
        /// Start feeding `records` into `store`.
        pub fn start<I>(records: I, store: Arc<Store>) -> Session
        where
            I: IntoIterator<Item = Result<Record>> + Send + 'static,
        {
            let (tx, first) = bounded(1);
            let producer = Arc::clone(&store);
            let handle = thread::spawn(move || {
                info!("Ingestion started");
                let mut tx = Some(tx);
                let result = feed_with(records, &producer, || {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(());
                    }
                });
                match result {
                    Ok(ref summary) => info!(
                        "Ingestion finished after {} samples and {} metadata entries",
                        summary.samples, summary.metadata
                    ),
                    Err(ref e) => info!("Ingestion stopped: {}", e),
                }
                result
            });
            Session {
                store,
                first,
                started: AtomicBool::new(false),
                handle,
            }
        }

        /// The store samples go into.
        pub fn store(&self) -> &Arc<Store> {
            &self.store
        }

        /// Wait until the first sample has been ingested, for at most `timeout`.
        ///
        /// Returns `false` if the timeout expired, or if the stream ended (or failed) without
        /// producing a single sample.
        pub fn wait_for_first_sample(&self, timeout: Duration) -> bool {
            if self.started.load(Ordering::Acquire) {
                return true;
            }
            match self.first.recv_timeout(timeout) {
                Ok(()) => {
                    self.started.store(true, Ordering::Release);
                    true
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
            }
        }

        /// Whether the producer has stopped, because its input ended or failed.
        pub fn is_finished(&self) -> bool {
            self.handle.is_finished()
        }

        /// Wait for the producer to stop and return how it went.
        pub fn join(self) -> Result<Summary> {
            match self.handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    }
}
