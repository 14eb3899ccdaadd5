#[macro_use]
extern crate log;

use std::error::Error;
use std::time::Duration;

use chunkcat::pipe::{copy_range, report_progress};
use chunkcat::progress_reporter::ProgressReporter;
use chunkcat::resource::ChunkSource;
use chunkcat::{RangeOptions, RangeStream};
use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use indicatif_log_bridge::LogWrapper;
use tokio::fs::File;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

const MB_TO_BYTES: u64 = 1024 * 1024;
const RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local path or http(s) url to read from
    source: String,

    #[arg(short, long, default_value_t = 2 * MB_TO_BYTES)]
    chunk_length: u64,

    /// First byte to copy
    #[arg(short, long)]
    start: Option<u64>,

    /// Last byte to copy, inclusive
    #[arg(short, long)]
    end: Option<u64>,

    /// Write here instead of stdout
    #[arg(short, long, default_value = None)]
    output: Option<String>,

    /// Fetch a missed chunk one more time before giving up
    #[arg(long)]
    retry_on_miss: bool,

    /// Fail a missed chunk whose retry hasn't started after this long
    #[arg(long)]
    miss_timeout_ms: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: simplelog::LevelFilter,
}

fn init_logging(level: simplelog::LevelFilter, multi: MultiProgress) -> Result<(), Box<dyn Error>> {
    let logger = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );
    LogWrapper::new(multi, logger).try_init()?;
    log::set_max_level(level);
    Ok(())
}

fn range_options(args: &CliArgs) -> RangeOptions {
    let mut options = RangeOptions::new();
    if let Some(start) = args.start {
        options = options.start(start);
    }
    if let Some(end) = args.end {
        options = options.end(end);
    }
    if let Some(ms) = args.miss_timeout_ms {
        options = options.miss_timeout(Duration::from_millis(ms));
    }
    if args.retry_on_miss {
        options = options.on_miss(|err, index, retry| {
            warn!("chunk {index} failed ({err}), retrying in {RETRY_DELAY:?}");
            tokio::spawn(async move {
                tokio::time::sleep(RETRY_DELAY).await;
                if let Err(e) = retry.retry() {
                    error!("{e}");
                }
            });
        });
    }
    options
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let multi = MultiProgress::new();
    if args.output.is_none() {
        multi.set_draw_target(ProgressDrawTarget::hidden());
    }
    init_logging(args.log_level, multi.clone())?;

    let source = ChunkSource::parse(&args.source)?;
    debug!("reading from {source:?}");
    let store = source.open(args.chunk_length).await?;

    let stream = RangeStream::new(store, range_options(&args))?;
    let range = stream.range();
    info!("copying bytes {}..={}", range.start, range.end);

    let (s_progress, r_progress) = mpsc::channel(64);
    let reporter = ProgressReporter::new(r_progress, Some(range.byte_count()), multi).spawn();

    let mut output: Box<dyn AsyncWrite + Unpin> = match &args.output {
        Some(path) => Box::new(File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };
    let written = copy_range(report_progress(stream, s_progress), &mut output).await?;
    reporter.await?;

    debug!("wrote {written} bytes");
    Ok(())
}
