use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use flowtick::blocks::{BlockReport, BlockTracker, tracked_block_starts};
use flowtick::core::{FileCache, LineRange};
use flowtick::refresh::{RefreshGate, Session};
use flowtick::storage::{load_document, load_file_cache};
use flowtick::{ChecklistAnalyzer, Progress, ProgressTier, Settings};
use log::{debug, warn};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "flowtick",
    about = "Checklist progress for tracked blocks of a Markdown document",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON settings file (refreshInterval, colorMode, debug).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compute the progress of the list items in a line range.
    Progress(ProgressArgs),

    /// Report the progress of every ```flowtick block in a document.
    Blocks(BlocksArgs),

    /// Re-measure tracked blocks periodically and print changes.
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
struct ProgressArgs {
    /// Metadata cache JSON (an object with `listItems`, or a bare item array).
    cache: PathBuf,
    /// Inclusive first line of the range.
    #[arg(long)]
    start: Option<u32>,
    /// Exclusive last line of the range.
    #[arg(long)]
    end: Option<u32>,
    /// Emit JSON instead of a human-readable line.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct BlocksArgs {
    /// Metadata cache JSON with `listItems` and `sections`.
    cache: PathBuf,
    /// The Markdown document the cache describes.
    document: PathBuf,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    cache: PathBuf,
    document: PathBuf,
    /// Override the refresh interval from settings (milliseconds).
    #[arg(long)]
    refresh_ms: Option<u64>,
    /// Stop after this many refresh cycles.
    #[arg(long)]
    cycles: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(cli.settings.as_deref())?;
    init_logging(settings.log_level(cli.verbose));

    match cli.command {
        Commands::Progress(args) => handle_progress(args),
        Commands::Blocks(args) => handle_blocks(args, &settings),
        Commands::Watch(args) => handle_watch(args, &settings),
    }
}

fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn resolve_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path),
        None => Ok(Settings::default()),
    }
}

fn handle_progress(args: ProgressArgs) -> Result<()> {
    let ProgressArgs {
        cache,
        start,
        end,
        json,
    } = args;

    let cache = load_file_cache(&cache)?;
    let range = LineRange::new(start, end);
    let summary = summarize_range(&cache, range);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} {} ({} items in {})",
            summary.progress, summary.tier, summary.items, summary.range
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct RangeSummary {
    range: LineRange,
    items: usize,
    rate: f64,
    progress: Progress,
    tier: ProgressTier,
}

fn summarize_range(cache: &FileCache, range: LineRange) -> RangeSummary {
    let analyzer = ChecklistAnalyzer::from_cache(Some(cache));
    let rate = analyzer.completion_rate(range);
    let progress = Progress::from_rate(rate);
    RangeSummary {
        range,
        items: analyzer.items_in_range(range).len(),
        rate,
        progress,
        tier: progress.tier(),
    }
}

fn handle_blocks(args: BlocksArgs, settings: &Settings) -> Result<()> {
    let BlocksArgs {
        cache,
        document,
        json,
    } = args;

    let cache = load_file_cache(&cache)?;
    let text = load_document(&document)?;
    let reports = measure_blocks(&cache, &text, settings);

    if reports.is_empty() {
        eprintln!("No flowtick blocks found in {:?}.", document);
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}", format_report(report));
        }
    }
    Ok(())
}

fn measure_blocks(cache: &FileCache, document: &str, settings: &Settings) -> Vec<BlockReport> {
    let mut tracker = BlockTracker::new();
    tracker.sync(&tracked_block_starts(&cache.sections, document));
    tracker.report(&cache.list_items, settings.color_mode)
}

fn format_report(report: &BlockReport) -> String {
    format!(
        "{:<10} {:>4} {:<12} {}",
        report.range.to_string(),
        report.progress.to_string(),
        report.tier.as_str(),
        report.style
    )
}

fn handle_watch(args: WatchArgs, settings: &Settings) -> Result<()> {
    let WatchArgs {
        cache,
        document,
        refresh_ms,
        cycles,
    } = args;

    let interval = effective_interval(settings, refresh_ms)?;
    debug!("watching {:?} every {:?}", document, interval);

    // This loop is the only trigger, so the gate never refuses here. Hosts that also
    // refresh on document-change notifications share one gate across both sources.
    let gate = RefreshGate::new();
    let mut session = Session::new();
    let mut first = true;
    let mut completed = 0u64;

    loop {
        if let Some(_cycle) = gate.try_begin() {
            match load_snapshot(&cache, &document) {
                Ok((snapshot, text)) => {
                    let changed = session.refresh(&snapshot, &text, settings.color_mode);
                    // The first cycle prints every block, later ones only what moved.
                    let shown = if first {
                        first = false;
                        session
                            .blocks()
                            .report(&snapshot.list_items, settings.color_mode)
                    } else {
                        changed
                    };
                    for report in &shown {
                        println!(
                            "{} {}",
                            Local::now().format("%H:%M:%S"),
                            format_report(report)
                        );
                    }
                }
                Err(err) => warn!("skipping refresh: {err:#}"),
            }
        }

        completed += 1;
        if cycles.is_some_and(|max| completed >= max) {
            break;
        }
        thread::sleep(interval);
    }
    Ok(())
}

fn effective_interval(settings: &Settings, refresh_ms: Option<u64>) -> Result<Duration> {
    let interval = refresh_ms
        .map(Duration::from_millis)
        .unwrap_or(settings.refresh_interval);
    if interval.is_zero() {
        anyhow::bail!("--refresh-ms must be greater than zero");
    }
    Ok(interval)
}

fn load_snapshot(cache: &Path, document: &Path) -> Result<(FileCache, String)> {
    let snapshot = load_file_cache(cache).context("refreshing cache")?;
    let text = load_document(document).context("refreshing document")?;
    Ok((snapshot, text))
}
