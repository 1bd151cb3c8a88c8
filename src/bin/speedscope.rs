use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use ember::collapsed;
use ember::export::speedscope::Builder;
use ember::ingest;
use env_logger::Env;

#[derive(Debug, Parser)]
#[clap(
    name = "ember-speedscope",
    about,
    after_help = "\
[1] The input may be collapsed stacks or MOJO; the format is detected automatically. The output
    holds a time profile for each thread, and memory allocation and release profiles for threads
    sampled in full metrics mode. Load it at https://www.speedscope.app.
    "
)]
struct Opt {
    /// Stop at the first malformed line instead of skipping it
    #[clap(long = "strict")]
    strict: bool,

    /// Name of the profile [default: input file name]
    #[clap(long = "name", value_name = "STRING")]
    name: Option<String>,

    /// Silence all log output
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Input file, or STDIN if not specified
    #[clap(value_name = "PATH")]
    infile: Option<PathBuf>,

    /// Output file, or STDOUT if not specified
    #[clap(value_name = "OUTPUT")]
    outfile: Option<PathBuf>,
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

    let name = opt.name.clone().unwrap_or_else(|| {
        opt.infile
            .as_ref()
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stdin".to_string())
    });

    let mut builder = Builder::new(name);
    let records = ingest::open_file(
        opt.infile.as_ref(),
        collapsed::Options {
            strict: opt.strict,
        },
    )?;
    for record in records {
        builder.add_record(&record?);
    }

    match opt.outfile {
        Some(ref path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            builder.write(&mut writer)?;
            writer.flush()?;
        }
        None => {
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            builder.write(&mut writer)?;
            writer.flush()?;
        }
    }
    Ok(())
}
