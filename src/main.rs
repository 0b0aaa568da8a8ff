//! # Series Harvester CLI (`harvest`)
//!
//! The `harvest` binary drives harvest sessions against the Open Library
//! catalog and maintains the canonical series file.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the ledger and its schema |
//! | `harvest run` | Run a harvest session, then validate and merge |
//! | `harvest merge` | Validate and merge what the ledger already holds |
//! | `harvest detect "<title>"` | Show the detector's verdict for one title |
//! | `harvest strategies` | List query strategies and their sizes |
//! | `harvest stats` | Ledger counts per strategy and top series |
//!
//! ## Examples
//!
//! ```bash
//! # A bounded session over two strategies
//! harvest run --strategy authors,franchises --max-books 5000 --max-time 30
//!
//! # Inspect what would be merged without touching the canonical file
//! harvest merge --tier strict --dry-run
//!
//! # Check a title
//! harvest detect "One Piece, Vol. 42" --subject manga
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use series_harvester::catalog::OpenLibraryClient;
use series_harvester::config::{self, Config};
use series_harvester::detector::SeriesDetector;
use series_harvester::error::HarvestError;
use series_harvester::harvest::{self, Harvester, RunOptions, SessionOutcome};
use series_harvester::ledger::Ledger;
use series_harvester::planner::{QueryPlanner, Strategy};
use series_harvester::progress::ProgressMode;
use series_harvester::stats;
use series_harvester::validator::Tier;

/// Series Harvester CLI: a resumable bulk book harvester and series
/// detector for the Open Library catalog.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Series Harvester: bulk book harvesting and series detection over Open Library",
    version,
    long_about = "Series Harvester queries the Open Library catalog with a planned set of \
    strategies, detects series membership from titles, keeps a resumable ledger of every \
    analysed book, and merges validated series into a canonical JSON file."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`. A missing file means built-in
    /// defaults.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger file and schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run a harvest session.
    ///
    /// Resumes from the checkpoint when one exists, harvests until the plan
    /// or a budget is exhausted (or Ctrl-C), then aggregates, validates and
    /// merges the ledger into the canonical file and writes a report.
    Run {
        /// Strategies to run (repeatable or comma separated). Default: all.
        #[arg(long = "strategy", value_delimiter = ',')]
        strategies: Vec<Strategy>,

        /// Stop after analysing this many new books.
        #[arg(long)]
        max_books: Option<u64>,

        /// Stop after this many minutes.
        #[arg(long = "max-time")]
        max_minutes: Option<u64>,

        /// Stop after this many catalog searches.
        #[arg(long)]
        max_api_calls: Option<u64>,

        /// Acceptance tier: `permissive` or `strict`.
        #[arg(long)]
        tier: Option<Tier>,

        /// Validate but do not modify the canonical file.
        #[arg(long)]
        dry_run: bool,

        /// Continue from the checkpoint (the default when one exists).
        #[arg(long, conflicts_with = "fresh")]
        resume: bool,

        /// Ignore the checkpoint and start the plan from the beginning.
        #[arg(long)]
        fresh: bool,

        /// Progress output on stderr: `off`, `human` or `json`.
        /// Defaults to `human` on a terminal, otherwise `off`.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// Aggregate, validate and merge the existing ledger without harvesting.
    Merge {
        #[arg(long)]
        tier: Option<Tier>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Print the detector's verdict for a title.
    Detect {
        title: String,

        /// Subject attached to the book (repeatable).
        #[arg(long = "subject")]
        subjects: Vec<String>,
    },

    /// List query strategies and how many queries each plans.
    Strategies,

    /// Show ledger statistics.
    Stats,
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!("unknown progress mode '{}'. Must be off, human or json.", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let ledger = Ledger::open(&cfg.paths.ledger).await?;
            ledger.close().await;
            println!("Ledger initialized at {}", cfg.paths.ledger.display());
        }
        Commands::Run {
            strategies,
            max_books,
            max_minutes,
            max_api_calls,
            tier,
            dry_run,
            resume: _,
            fresh,
            progress,
        } => {
            let options = RunOptions {
                strategies,
                max_books,
                max_minutes,
                max_api_calls,
                tier,
                dry_run,
                fresh,
            };
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_session(&cfg, &options, mode).await?;
        }
        Commands::Merge { tier, dry_run } => {
            let result = harvest::merge_only(&cfg, tier, dry_run).await;
            print_outcome(result);
        }
        Commands::Detect { title, subjects } => {
            let detector = SeriesDetector::new(&cfg.detector);
            let matches = detector.matches(&title, subjects.iter().map(String::as_str));
            for m in &matches {
                println!(
                    "  {:<16} {:<32} vol {:<6} base {:>3}  conf {:>3}",
                    m.pattern,
                    m.series_name,
                    m.volume.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
                    m.base,
                    m.confidence
                );
            }
            let detection = detector.detect_title(&title, subjects.iter().map(String::as_str));
            match detection.series_name {
                Some(name) => println!(
                    "series: {}  volume: {}  confidence: {}",
                    name,
                    detection
                        .volume
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    detection.confidence
                ),
                None => println!("no series detected"),
            }
        }
        Commands::Strategies => {
            let planner = QueryPlanner::new(&cfg.planner, &cfg.detector);
            println!("{:<16} {:>8}  DESCRIPTION", "STRATEGY", "QUERIES");
            for strategy in Strategy::ALL {
                println!(
                    "{:<16} {:>8}  {}",
                    strategy.tag(),
                    planner.queries_for(strategy).len(),
                    strategy.description()
                );
            }
            println!("{:<16} {:>8}", "total", planner.total_queries());
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_session(cfg: &Config, options: &RunOptions, mode: ProgressMode) -> anyhow::Result<()> {
    let client = OpenLibraryClient::new(&cfg.catalog)?;
    let reporter = mode.reporter();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current batch");
            on_signal.cancel();
        }
    });

    let result = Harvester::new(cfg, &client)
        .with_progress(reporter.as_ref())
        .with_cancel(cancel)
        .run(options)
        .await;
    print_outcome(result);
    Ok(())
}

/// Print where the results went, or the error kind and backup path and
/// exit non-zero.
fn print_outcome(result: Result<SessionOutcome, HarvestError>) {
    match result {
        Ok(outcome) => {
            let report = &outcome.report;
            println!(
                "Session {} finished ({}): {} analysed, {} series added, {} duplicate(s).",
                report.session_id,
                report.stop_reason.as_str(),
                report.counters.books_analysed,
                report.added.len(),
                report.duplicates.len()
            );
            if report.dry_run {
                println!("Dry run: canonical file not modified.");
            }
            println!("Canonical: {}", report.canonical_path.display());
            if let Some(backup) = &report.backup_path {
                println!("Backup:    {}", backup.display());
            }
            println!("Report:    {}", outcome.report_json.display());
            println!("           {}", outcome.report_text.display());
        }
        Err(e) => {
            if e.is_fatal() {
                tracing::error!("{}: {}", e.kind(), e);
            } else {
                tracing::warn!("{}: {}", e.kind(), e);
            }
            eprintln!("{}", failure_message(&e));
            std::process::exit(1);
        }
    }
}

/// Console lines for a failed session: the error kind, then the backup to
/// restore from when the canonical file could not be written.
fn failure_message(e: &HarvestError) -> String {
    let mut message = format!("error: {}: {}", e.kind(), e);
    if let Some(backup) = e.backup_path() {
        message.push_str(&format!("\nbackup: {}", backup.display()));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_write_failure_names_the_backup() {
        let err = HarvestError::CanonicalWrite {
            path: PathBuf::from("data/series.json"),
            backup: Some(PathBuf::from("data/backup_20240101_000000.json")),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let message = failure_message(&err);
        let mut lines = message.lines();
        assert!(lines.next().unwrap().starts_with("error: CanonicalWriteError: "));
        assert_eq!(lines.next(), Some("backup: data/backup_20240101_000000.json"));
    }

    #[test]
    fn other_failures_have_no_backup_line() {
        let err = HarvestError::MergeLocked(PathBuf::from("data/series.json"));
        assert_eq!(failure_message(&err).lines().count(), 1);
    }
}
