//! Ember turns the output of a sampling profiler into live, per-thread call trees.
//!
//! A sampler such as [austin] periodically records the call stack of every thread of a process,
//! along with how much time (and, in full metrics mode, memory) was spent since the previous
//! sample. Ember reads those samples, in either of the two formats samplers write them in, and
//! folds them into one call tree per thread while they keep coming in. Each tree node knows how
//! much was spent in it directly and in it plus everything it called, and the tree remembers
//! which path the latest sample took so that live views can highlight what each thread is doing
//! right now.
//!
//! # Input formats
//!
//! - _Collapsed stacks_ are text, one sample per line, as described in [`collapsed`]:
//!
//!   ```text
//!   P4242;T7;main (app.py:L12);work (lib.py:L40) 1520
//!   ```
//!
//! - _MOJO_ is a compact binary event stream, described in [`mojo`]. Frames are defined once and
//!   referenced by key afterwards, and integers are variable-length.
//!
//! [`ingest::open`] tells the two apart by looking at the start of the stream.
//!
//! # Command-line use
//!
//! Three binaries cover the common conversions:
//!
//! ```console
//! $ ember-mojo2collapsed profile.mojo > profile.austin
//! $ ember-speedscope profile.mojo profile.json
//! $ ember-tree --thread P4242:T7 profile.austin
//! ```
//!
//! The speedscope output can be loaded into [speedscope], and the collapsed output into any
//! flame graph tool that accepts folded stacks.
//!
//! # Programmatic access
//!
//! ```
//! use ember::ingest;
//! use ember::store::Store;
//!
//! let input = "P1;T1;main (app.py:L1);foo (app.py:L5) 100\n\
//!              P1;T1;main (app.py:L1);bar (app.py:L9) 30\n";
//! let store = Store::default();
//! let records = ingest::open(input.as_bytes(), Default::default())?;
//! ingest::feed(records, &store)?;
//!
//! let snapshot = store.snapshot(&"P1:T1".into())?;
//! let main = &snapshot.tree.roots()[0];
//! assert_eq!((main.own, main.total), (0, 130));
//! # Ok::<(), ember::Error>(())
//! ```
//!
//!   [austin]: https://github.com/P403n1x87/austin
//!   [speedscope]: https://www.speedscope.app

#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[macro_use]
extern crate log;

/// The collapsed stack line format.
pub mod collapsed;

/// Error types.
pub mod error;

/// Rendering aggregated samples.
pub mod export;

/// Detecting input formats and feeding samples into a store.
pub mod ingest;

/// The binary MOJO trace format.
pub mod mojo;

/// Frames, samples and their metrics.
pub mod sample;

/// Thread-safe aggregation of samples.
pub mod store;

/// Per-thread call trees.
pub mod tree;

pub use crate::error::{Error, Result};
