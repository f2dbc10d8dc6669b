use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use frametrace::config::Config;
use frametrace::dispatch::Dispatcher;
use frametrace::metadata::MetadataResolver;
use frametrace::output::{CsvOptions, CsvWriter};
use frametrace::queues::{OutputQueues, ProcessFilter};
use frametrace::session::{self, TraceData};
use frametrace::tracker::{PresentTracker, TrackerOptions};

/// Present-pipeline trace consumer.
#[derive(Parser)]
#[command(name = "frametrace", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recorded trace file and write the completed presents.
    Replay {
        /// The recorded trace to consume.
        trace: PathBuf,

        /// Write completed presents to this CSV file (overrides the config).
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("frametrace {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Replay { trace, csv } => rt.block_on(run_replay(cfg, trace, csv)),
        Command::Version => unreachable!("handled above"),
    }
}

async fn run_replay(cfg: Config, trace_path: PathBuf, csv_override: Option<PathBuf>) -> Result<()> {
    let cancel = CancellationToken::new();

    // Ctrl-C stops the replay early; whatever has completed is kept.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping replay");
                cancel.cancel();
            }
        });
    }

    let queues = Arc::new(OutputQueues::new());
    let filter = Arc::new(ProcessFilter::new());
    if !cfg.tracking.tracked_processes.is_empty() {
        filter.set_enabled(true);
        for pid in &cfg.tracking.tracked_processes {
            filter.add(*pid);
        }
    }

    let mut tracker = PresentTracker::new(
        TrackerOptions {
            track_display: cfg.tracking.track_display,
            ring_capacity: cfg.tracking.ring_capacity,
            deferral_presents: cfg.tracking.deferral_presents,
        },
        Arc::clone(&queues),
        Arc::clone(&filter),
    );
    tracker.set_filtered_events(cfg.tracking.filtered_events);
    let mut dispatcher = Dispatcher::new(MetadataResolver::with_defaults(), tracker);

    let csv_path = csv_override.or_else(|| cfg.output.csv_path.clone());
    let mut csv = match &csv_path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating output file {}", path.display()))?;
            Some(CsvWriter::new(
                BufWriter::new(file),
                CsvOptions {
                    track_display: cfg.tracking.track_display,
                    track_debug: cfg.tracking.track_debug,
                    timestamp_frequency: cfg.timestamp_frequency,
                },
            )?)
        }
        None => None,
    };

    let trace = TraceData::open(&trace_path)
        .with_context(|| format!("opening trace {}", trace_path.display()))?;
    tracing::info!(trace = %trace_path.display(), "replaying trace");

    // TimeInSeconds is relative to the first event in the trace.
    if let Some(csv) = &mut csv {
        if let Some(Ok(first)) = trace.events().next() {
            csv.set_start_timestamp(first.timestamp);
        }
    }

    // The processing loop runs the dispatcher to completion off the async
    // runtime; the drain loop below consumes its output concurrently.
    let replay_cancel = cancel.clone();
    let mut replay_task = tokio::task::spawn_blocking(move || {
        let delivered = session::replay(&trace, &mut dispatcher, || replay_cancel.is_cancelled());
        (dispatcher, delivered)
    });

    let mut ticker = tokio::time::interval(cfg.drain_interval);
    let mut completed_total = 0u64;
    let mut lost_total = 0u64;

    let dispatcher = loop {
        tokio::select! {
            joined = &mut replay_task => {
                let (dispatcher, delivered) = joined.context("replay task panicked")?;
                let delivered = delivered.context("reading trace")?;
                tracing::info!(events = delivered, "replay finished");
                break dispatcher;
            }
            _ = ticker.tick() => {
                drain(&queues, &mut csv, &mut completed_total, &mut lost_total)?;
            }
        }
    };

    // Final drain after the processing loop exits.
    drain(&queues, &mut csv, &mut completed_total, &mut lost_total)?;
    if let Some(csv) = &mut csv {
        csv.flush().context("flushing output")?;
    }

    let stats = dispatcher.stats();
    tracing::info!(
        completed = completed_total,
        lost = lost_total,
        handled = stats.handled,
        dropped = stats.dropped,
        decode_failures = stats.decode_failures,
        in_flight_at_exit = dispatcher.tracker().live_presents(),
        "trace consumed",
    );

    Ok(())
}

fn drain(
    queues: &OutputQueues,
    csv: &mut Option<CsvWriter<BufWriter<File>>>,
    completed_total: &mut u64,
    lost_total: &mut u64,
) -> Result<()> {
    for event in queues.take_process_events() {
        if let Some(csv) = csv.as_mut() {
            csv.note_process_event(&event);
        }
    }
    for present in queues.take_completed() {
        *completed_total += 1;
        if let Some(csv) = csv.as_mut() {
            csv.write_present(&present).context("writing present row")?;
        }
    }
    *lost_total += queues.take_lost().len() as u64;
    Ok(())
}
