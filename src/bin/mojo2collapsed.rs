use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use ember::collapsed;
use ember::mojo::Samples;
use env_logger::Env;

#[derive(Debug, Parser)]
#[clap(
    name = "ember-mojo2collapsed",
    about,
    after_help = "\
[1] Metadata is written as `# key: value` lines, samples as collapsed stack lines. Full metrics
    are written as `time,idle,memory`.
    "
)]
struct Opt {
    /// Silence all log output
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// MOJO input file, or STDIN if not specified
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

    let reader: Box<dyn io::BufRead> = match opt.infile {
        Some(ref path) => Box::new(io::BufReader::new(File::open(path)?)),
        None => Box::new(io::stdin().lock()),
    };

    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    for record in Samples::new(reader)? {
        collapsed::write_record(&mut writer, &record?)?;
    }
    writer.flush()?;
    Ok(())
}
