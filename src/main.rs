//! a2-replay - Replays a recorded readout stream through an analysis
//!
//! # Usage
//!
//! ```bash
//! # Replay and write histograms plus a JSON run summary
//! a2-replay analysis.toml run042.bin --histos run042.histos --summary run042.json
//!
//! # Also log to a file
//! a2-replay analysis.json run042.bin --log-file replay.log
//! ```

use a2_engine::config::{build_analysis, AnalysisConfig};
use a2_engine::operators::{write_histo_list, H1D};
use a2_engine::replay::{replay, ReplayStats, Ticker};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Replay a readout stream through an a2 analysis
#[derive(Parser, Debug)]
#[command(name = "a2-replay")]
#[command(version)]
#[command(about = "Replay recorded readout data through an a2 analysis")]
struct Args {
    /// Analysis configuration (.toml or .json)
    config: PathBuf,

    /// Recorded event stream
    input: PathBuf,

    /// Output file for all 1D histograms
    #[arg(long, default_value = "histos.bin")]
    histos: PathBuf,

    /// Write the run summary here instead of stdout
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Timetick interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    config: PathBuf,
    input: PathBuf,
    started: DateTime<Utc>,
    stopped: DateTime<Utc>,
    #[serde(flatten)]
    stats: ReplayStats,
    sources: usize,
    operators: usize,
    histograms: usize,
    arena_used: usize,
    arena_capacity: usize,
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("invalid log file path {:?}", path))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,a2_engine=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_tracing(args.log_file.as_deref())?;

    let config = AnalysisConfig::load(&args.config)
        .with_context(|| format!("loading {:?}", args.config))?;
    let mut analysis = build_analysis(&config).context("building analysis")?;
    let a2 = &mut analysis.a2;

    let input = File::open(&args.input).with_context(|| format!("opening {:?}", args.input))?;
    let ticker = Ticker::spawn(Duration::from_millis(args.tick_ms.max(1)));

    let started = Utc::now();
    a2.begin_run();
    let result = replay(a2, BufReader::new(input), ticker.ticks());
    a2.end_run();
    let stopped = Utc::now();
    drop(ticker);

    let stats = result.context("replaying input")?;
    tracing::info!(
        "replayed {} events ({} words) in {} ms",
        stats.events,
        stats.words,
        (stopped - started).num_milliseconds()
    );

    let histos: Vec<&H1D> = a2.h1d_histos().collect();
    let mut out = BufWriter::new(
        File::create(&args.histos).with_context(|| format!("creating {:?}", args.histos))?,
    );
    write_histo_list(&mut out, a2.arena(), histos.iter().copied())?;
    out.flush()?;

    let summary = RunSummary {
        config: args.config.clone(),
        input: args.input.clone(),
        started,
        stopped,
        stats,
        sources: a2.source_count(),
        operators: a2.operator_count(),
        histograms: histos.len(),
        arena_used: a2.arena().used(),
        arena_capacity: a2.arena().capacity(),
    };
    let json = serde_json::to_string_pretty(&summary)?;

    match &args.summary {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {:?}", path))?;
        }
        None => println!("{}", json),
    }

    Ok(())
}
