use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use ember::export::{json, view};
use ember::sample::{MetricKind, ThreadKey};
use ember::store::{Options, Store};
use ember::{collapsed, ingest};
use env_logger::Env;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Metric {
    /// Wall clock time
    Wall,
    /// Time spent while not idle
    Cpu,
    /// Bytes allocated
    Alloc,
    /// Bytes released
    Dealloc,
}

impl From<Metric> for MetricKind {
    fn from(metric: Metric) -> Self {
        match metric {
            Metric::Wall => MetricKind::WallTime,
            Metric::Cpu => MetricKind::CpuTime,
            Metric::Alloc => MetricKind::MemoryAlloc,
            Metric::Dealloc => MetricKind::MemoryDealloc,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(
    name = "ember-tree",
    about,
    after_help = "\
[1] Aggregates collapsed stacks or MOJO into per-thread call trees and prints them with the own
    and total metric of every frame. Frames on the path of each thread's latest sample are marked
    with `>`.
    "
)]
struct Opt {
    /// Metric to aggregate
    #[clap(long = "metric", value_enum, default_value = "wall")]
    metric: Metric,

    /// Only print this thread (e.g. P4242:T7)
    #[clap(long = "thread", value_name = "KEY")]
    thread: Option<String>,

    /// Only print the latest stack of each thread
    #[clap(long = "current", conflicts_with = "json")]
    current: bool,

    /// Print a JSON tree instead of a table
    #[clap(long = "json")]
    json: bool,

    /// Stop at the first malformed line instead of skipping it
    #[clap(long = "strict")]
    strict: bool,

    /// Silence all log output
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Input file, or STDIN if not specified
    #[clap(value_name = "PATH")]
    infile: Option<PathBuf>,
}

fn main() -> Result<(), ember::Error> {
    let opt = Opt::parse();

    // Initialize logger
    if !opt.quiet {
        env_logger::Builder::from_env(Env::default().default_filter_or(match opt.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }))
        .format_timestamp(None)
        .init();
    }

    let store = Store::from(Options {
        metric: opt.metric.into(),
    });
    let records = ingest::open_file(
        opt.infile.as_ref(),
        collapsed::Options {
            strict: opt.strict,
        },
    )?;
    ingest::feed(records, &store)?;

    let thread = opt.thread.map(ThreadKey::from);
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());

    if opt.current {
        let mut stacks = store.current_stacks(false);
        if let Some(ref thread) = thread {
            stacks.retain(|stack| &stack.thread == thread);
        }
        view::render_current(&stacks, &mut writer)?;
    } else {
        let snapshots = match thread {
            Some(ref thread) => vec![store.snapshot(thread)?],
            None => store.snapshot_all(),
        };
        if opt.json {
            json::to_writer(&snapshots, &mut writer)?;
            writeln!(writer)?;
        } else {
            for snapshot in &snapshots {
                view::render_tree(snapshot, &mut writer)?;
            }
        }
    }

    writer.flush()?;
    Ok(())
}
