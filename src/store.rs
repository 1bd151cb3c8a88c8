//! Thread-safe aggregation of samples into per-thread call trees.
//!
//! A [`Store`] is shared between a producer, which keeps [`ingest`](Store::ingest)ing samples as
//! they are decoded, and any number of consumers reading [`snapshot`](Store::snapshot)s. Every
//! operation takes the store's single lock exactly once, and never does I/O while holding it.
//! Consumers always get deep copies, so they never observe a tree halfway through a merge.
//!
//! Consumers that want only what arrived since their last read [`subscribe`](Store::subscribe)
//! and then [`drain`](Store::drain) periodically. Each subscriber has its own delta trees, so
//! several of them can drain independently.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::sample::{Frame, MetricKind, Record, Sample, ThreadKey};
use crate::tree::CallTree;

/// Metadata key under which samplers report memory maps.
pub const MAP_KEY: &str = "map";

/// Configure how a [`Store`] aggregates samples.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// The metric call trees aggregate.
    ///
    /// Default is `MetricKind::WallTime`.
    pub metric: MetricKind,
}

/// Which threads to [`reset`](Store::reset).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reset {
    /// Every thread.
    All,
    /// A single thread.
    Thread(ThreadKey),
}

/// A deep copy of one thread's call tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// The thread the tree belongs to.
    pub thread: ThreadKey,
    /// The tree, with the active path marked.
    pub tree: CallTree,
}

/// One frame of a thread's current stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameStats {
    /// The node's label.
    pub label: String,
    /// The frame the node was created from.
    pub frame: Frame,
    /// Metric spent with this frame innermost.
    pub own: u64,
    /// Metric spent in this frame and below.
    pub total: u64,
}

/// What a thread was last seen doing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stack {
    /// The thread.
    pub thread: ThreadKey,
    /// Its latest stack, outermost frame first. Empty when the thread was last seen idle.
    pub frames: Vec<FrameStats>,
}

/// A subscriber to a [`Store`]'s deltas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Forest = AHashMap<ThreadKey, CallTree>;

fn sorted_keys(forest: &Forest) -> Vec<ThreadKey> {
    let mut keys: Vec<_> = forest.keys().cloned().collect();
    keys.sort();
    keys
}

fn snapshots(forest: &Forest) -> Vec<Snapshot> {
    sorted_keys(forest)
        .into_iter()
        .filter_map(|thread| {
            let tree = forest.get(&thread)?.snapshot();
            Some(Snapshot { thread, tree })
        })
        .collect()
}

#[derive(Debug, Default)]
struct Inner {
    trees: Forest,
    deltas: AHashMap<ConsumerId, Forest>,
    next_consumer: u64,
    metadata: IndexMap<String, String>,
    maps: Vec<String>,
    samples: u64,
}

/// Per-thread call trees behind one lock.
#[derive(Debug, Default)]
pub struct Store {
    opt: Options,
    inner: Mutex<Inner>,
}

impl From<Options> for Store {
    fn from(opt: Options) -> Self {
        Store {
            opt,
            inner: Mutex::default(),
        }
    }
}

impl Store {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // no mutation leaves a tree half-merged, even if its holder panicked
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }

    /// The metric this store aggregates.
    pub fn metric(&self) -> MetricKind {
        self.opt.metric
    }

    /// Fold a sample into its thread's tree, creating the tree on the thread's first sample.
    ///
    /// The sample also goes into the delta trees of every subscriber.
    pub fn ingest(&self, sample: &Sample) {
        let key = sample.thread_key();
        let metric = self.opt.metric;
        let mut inner = self.lock();
        inner.samples += 1;
        for forest in inner.deltas.values_mut() {
            forest.entry(key.clone()).or_default().add(sample, metric);
        }
        inner.trees.entry(key).or_default().add(sample, metric);
    }

    /// Ingest a sample, or remember a metadata entry.
    ///
    /// Metadata is kept in the order keys were first seen, with later values replacing earlier
    /// ones. Memory maps are all kept, see [`maps`](Store::maps).
    pub fn record(&self, record: &Record) {
        match record {
            Record::Sample(sample) => self.ingest(sample),
            Record::Metadata { key, value } => {
                let mut inner = self.lock();
                if key == MAP_KEY {
                    inner.maps.push(value.clone());
                } else {
                    inner.metadata.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// A deep copy of a thread's tree.
    pub fn snapshot(&self, thread: &ThreadKey) -> Result<Snapshot> {
        let inner = self.lock();
        let tree = inner
            .trees
            .get(thread)
            .ok_or_else(|| Error::UnknownThread(thread.clone()))?
            .snapshot();
        Ok(Snapshot {
            thread: thread.clone(),
            tree,
        })
    }

    /// Deep copies of every thread's tree, sorted by thread.
    pub fn snapshot_all(&self) -> Vec<Snapshot> {
        snapshots(&self.lock().trees)
    }

    /// The threads seen so far, sorted.
    pub fn list_threads(&self) -> Vec<ThreadKey> {
        sorted_keys(&self.lock().trees)
    }

    /// Forget the aggregated samples of some or all threads.
    ///
    /// A thread that was reset is unknown until it is sampled again. Resetting a thread that was
    /// never seen is an [`Error::UnknownThread`]. Subscribers' pending deltas are kept.
    pub fn reset(&self, which: Reset) -> Result<()> {
        let mut inner = self.lock();
        match which {
            Reset::All => inner.trees.clear(),
            Reset::Thread(thread) => {
                if inner.trees.remove(&thread).is_none() {
                    return Err(Error::UnknownThread(thread));
                }
            }
        }
        Ok(())
    }

    /// Start collecting deltas for a new consumer.
    ///
    /// Only samples ingested from now on show up in its [`drain`](Store::drain)s.
    pub fn subscribe(&self) -> ConsumerId {
        let mut inner = self.lock();
        let id = ConsumerId(inner.next_consumer);
        inner.next_consumer += 1;
        inner.deltas.insert(id, Forest::default());
        debug!("Consumer {} subscribed", id);
        id
    }

    /// Stop collecting deltas for a consumer.
    pub fn unsubscribe(&self, consumer: ConsumerId) -> Result<()> {
        match self.lock().deltas.remove(&consumer) {
            Some(_) => {
                debug!("Consumer {} unsubscribed", consumer);
                Ok(())
            }
            None => Err(Error::UnknownConsumer(consumer)),
        }
    }

    /// Snapshot a consumer's delta trees and reset them in one go.
    ///
    /// Calling this periodically yields the samples ingested since the consumer's previous call,
    /// with none lost or counted twice. Other consumers and the store's own trees are unaffected.
    pub fn drain(&self, consumer: ConsumerId) -> Result<Vec<Snapshot>> {
        let mut inner = self.lock();
        let forest = inner
            .deltas
            .get_mut(&consumer)
            .ok_or(Error::UnknownConsumer(consumer))?;
        let drained = snapshots(forest);
        forest.clear();
        Ok(drained)
    }

    /// The current stack of every thread sampled since the last reset, sorted by thread.
    ///
    /// With `reset_after`, every thread stops being current until its next sample. The trees
    /// themselves keep all their values.
    pub fn current_stacks(&self, reset_after: bool) -> Vec<Stack> {
        let mut inner = self.lock();
        let stacks: Vec<_> = sorted_keys(&inner.trees)
            .into_iter()
            .filter_map(|thread| {
                let tree = inner.trees.get(&thread)?;
                if !tree.is_current() {
                    return None;
                }
                let frames = tree
                    .active_nodes()
                    .into_iter()
                    .map(|node| FrameStats {
                        label: node.label.clone(),
                        frame: node.frame.clone(),
                        own: node.own,
                        total: node.total,
                    })
                    .collect();
                Some(Stack { thread, frames })
            })
            .collect();
        if reset_after {
            for tree in inner.trees.values_mut() {
                tree.clear_active();
            }
        }
        stacks
    }

    /// Number of samples ingested since the store was created.
    ///
    /// Resets do not affect this count.
    pub fn samples(&self) -> u64 {
        self.lock().samples
    }

    /// Metadata entries other than memory maps, in first-seen order.
    pub fn metadata(&self) -> IndexMap<String, String> {
        self.lock().metadata.clone()
    }

    /// Memory maps reported by the sampler, uninterpreted.
    pub fn maps(&self) -> Vec<String> {
        self.lock().maps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Metrics;

    fn sample(tid: &str, names: &[&str], value: i64) -> Sample {
        Sample {
            pid: Some(1),
            tid: tid.to_string(),
            frames: names
                .iter()
                .map(|name| Frame::new(*name, "app.py", 1))
                .collect(),
            metrics: Metrics::Single(value),
        }
    }

    #[test]
    fn threads_are_kept_apart() {
        let store = Store::default();
        store.ingest(&sample("2", &["main"], 10));
        store.ingest(&sample("1", &["main"], 5));
        store.ingest(&sample("1", &["main"], 5));

        assert_eq!(
            store.list_threads(),
            vec![ThreadKey::from("P1:T1"), ThreadKey::from("P1:T2")]
        );
        let t1 = store.snapshot(&"P1:T1".into()).unwrap();
        assert_eq!(t1.tree.total(), 10);
        assert_eq!(store.samples(), 3);
    }

    #[test]
    fn unknown_threads() {
        let store = Store::default();
        assert!(matches!(
            store.snapshot(&"T9".into()),
            Err(Error::UnknownThread(_))
        ));
        assert!(matches!(
            store.reset(Reset::Thread("T9".into())),
            Err(Error::UnknownThread(_))
        ));
        assert!(store.reset(Reset::All).is_ok());
    }

    #[test]
    fn reset_forgets_thread() {
        let store = Store::default();
        store.ingest(&sample("1", &["main"], 10));
        store.ingest(&sample("2", &["main"], 10));
        store.reset(Reset::Thread("P1:T1".into())).unwrap();
        assert_eq!(store.list_threads(), vec![ThreadKey::from("P1:T2")]);
        assert!(store.snapshot(&"P1:T1".into()).is_err());
    }

    #[test]
    fn snapshots_are_copies() {
        let store = Store::default();
        store.ingest(&sample("1", &["main"], 10));
        let before = store.snapshot(&"P1:T1".into()).unwrap();
        store.ingest(&sample("1", &["main"], 10));
        assert_eq!(before.tree.total(), 10);
        assert_eq!(store.snapshot(&"P1:T1".into()).unwrap().tree.total(), 20);
    }

    #[test]
    fn drain_returns_deltas() {
        let store = Store::default();
        store.ingest(&sample("1", &["main"], 7));
        let consumer = store.subscribe();
        store.ingest(&sample("1", &["main"], 10));
        assert_eq!(store.drain(consumer).unwrap()[0].tree.total(), 10);
        assert!(store.drain(consumer).unwrap().is_empty());
        store.ingest(&sample("1", &["main"], 3));
        assert_eq!(store.drain(consumer).unwrap()[0].tree.total(), 3);

        // the store's own trees keep everything
        assert_eq!(store.snapshot(&"P1:T1".into()).unwrap().tree.total(), 20);
    }

    #[test]
    fn consumers_drain_independently() {
        let store = Store::default();
        let a = store.subscribe();
        let b = store.subscribe();
        store.ingest(&sample("1", &["main"], 10));

        let total = |drained: Vec<Snapshot>| drained.iter().map(|s| s.tree.total()).sum::<u64>();
        assert_eq!(total(store.drain(a).unwrap()), 10);
        assert_eq!(total(store.drain(b).unwrap()), 10);

        store.ingest(&sample("1", &["main"], 5));
        store.unsubscribe(a).unwrap();
        assert!(matches!(store.drain(a), Err(Error::UnknownConsumer(_))));
        assert!(matches!(store.unsubscribe(a), Err(Error::UnknownConsumer(_))));
        assert_eq!(total(store.drain(b).unwrap()), 5);
    }

    #[test]
    fn current_stacks() {
        let store = Store::default();
        store.ingest(&sample("1", &["main", "a"], 10));
        store.ingest(&sample("1", &["main", "b"], 4));
        store.ingest(&sample("2", &[], 4));

        let stacks = store.current_stacks(true);
        assert_eq!(stacks.len(), 2);
        let frames: Vec<_> = stacks[0]
            .frames
            .iter()
            .map(|f| (f.frame.scope.as_str(), f.own, f.total))
            .collect();
        assert_eq!(frames, vec![("main", 0, 14), ("b", 4, 4)]);
        assert!(stacks[1].frames.is_empty());

        // nothing sampled since the reset
        assert!(store.current_stacks(false).is_empty());
        assert_eq!(store.list_threads().len(), 2);

        store.ingest(&sample("1", &["main", "a"], 5));
        let stacks = store.current_stacks(false);
        assert_eq!(stacks.len(), 1);
        let frames: Vec<_> = stacks[0]
            .frames
            .iter()
            .map(|f| (f.frame.scope.as_str(), f.own, f.total))
            .collect();
        assert_eq!(frames, vec![("main", 0, 19), ("a", 15, 15)]);
        assert_eq!(store.snapshot(&"P1:T1".into()).unwrap().tree.total(), 19);
    }

    #[test]
    fn metadata_and_maps() {
        let store = Store::default();
        for (key, value) in &[
            ("mode", "wall"),
            ("map", "0-1 /lib/a.so"),
            ("interval", "100"),
            ("map", "1-2 /lib/b.so"),
            ("mode", "full"),
        ] {
            store.record(&Record::Metadata {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        let metadata: Vec<_> = store.metadata().into_iter().collect();
        assert_eq!(
            metadata,
            vec![
                ("mode".to_string(), "full".to_string()),
                ("interval".to_string(), "100".to_string())
            ]
        );
        assert_eq!(store.maps(), vec!["0-1 /lib/a.so", "1-2 /lib/b.so"]);
    }

    #[test]
    fn configured_metric() {
        let store = Store::from(Options {
            metric: MetricKind::MemoryDealloc,
        });
        store.ingest(&Sample {
            metrics: Metrics::Full {
                time: 100,
                idle: false,
                memory: -64,
            },
            ..sample("1", &["main"], 0)
        });
        assert_eq!(store.snapshot(&"P1:T1".into()).unwrap().tree.total(), 64);
    }
}
