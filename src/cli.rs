//! CLI parsing and top-level orchestration. Parses args, layers config under
//! flags, runs the sync engine, and maps errors to exit codes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::remote::{hako::HakoReader, BudgetedClient};
use crate::state::{StateError, StateStore};
use crate::sync::scheduler::{
    RequestBudget, DEFAULT_COOLDOWN_SECS, DEFAULT_MAX_WORKERS, DEFAULT_REQUESTS_BEFORE_COOLDOWN,
};
use crate::sync::{SyncEngine, SyncError, SyncOptions, TitleReport};

/// State file name inside the output directory.
const STATE_FILE: &str = "hakosync.json";

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Sync(#[from] SyncError),

    #[error("{0}")]
    State(#[from] StateError),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Sync(SyncError::Remote(_)) => 2,
            CliRunError::Sync(_) | CliRunError::State(_) => 3,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "hakosync")]
#[command(about = "Download ln.hako.vn light novels and keep local EPUB archives up to date")]
#[command(
    after_help = "Config file keys (output_dir, user_agent, timeout_secs, max_workers, requests_before_cooldown, cooldown_secs, retry_count, retry_backoff_secs) are documented in the README. CLI flags override config."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Output directory for archives and the state file. Default: config
    /// output_dir, else the current directory.
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Suppress progress output (errors only).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print phase transitions and full error chains.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// HTTP User-Agent (overrides config).
    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    /// Request timeout in seconds (overrides config; default 30).
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Simultaneous chapter fetches (overrides config; default 8).
    #[arg(long, global = true)]
    pub max_workers: Option<usize>,

    /// Requests issued before the global cooldown (overrides config; default 190).
    #[arg(long, global = true)]
    pub requests_before_cooldown: Option<u32>,

    /// Cooldown duration in seconds (overrides config; default 120).
    #[arg(long, global = true)]
    pub cooldown_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a title (or catch an already-downloaded one up).
    Download {
        /// Title URL, e.g. https://ln.hako.vn/truyen/123-some-novel
        url: String,
    },

    /// Download only a chapter range of a title, e.g. 1-10 (1-based,
    /// counted across all volumes).
    Chapters {
        /// Title URL.
        url: String,
        /// Inclusive range 'from-to'.
        #[arg(value_parser = parse_chapter_range)]
        range: (u32, u32),
    },

    /// Update one previously downloaded title.
    Update {
        /// Title URL.
        url: String,
    },

    /// Update every title recorded in the state file.
    UpdateAll,

    /// List recorded titles and their materialized chapter counts.
    List,
}

fn parse_chapter_range(s: &str) -> Result<(u32, u32), String> {
    let s = s.trim();
    let (from_str, to_str) = s
        .split_once('-')
        .ok_or_else(|| format!("Invalid range: expected 'from-to' (e.g. 1-10), got '{}'", s))?;
    let from: u32 = from_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid range: '{}' is not a chapter number", from_str.trim()))?;
    let to: u32 = to_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid range: '{}' is not a chapter number", to_str.trim()))?;
    if from == 0 {
        return Err("Invalid range: chapters are numbered from 1".to_string());
    }
    if from > to {
        return Err(format!(
            "Invalid range: start ({}) must be <= end ({})",
            from, to
        ));
    }
    Ok((from, to))
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code
/// and message on failure.
pub async fn run(args: &Args) -> Result<(), CliRunError> {
    let config = config::load_config().map_err(CliRunError::InvalidInput)?;

    let output_dir: PathBuf = args
        .output
        .clone()
        .or_else(|| config.as_ref().and_then(|c| c.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from("."));

    const DEFAULT_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_RETRY_COUNT: u32 = 3;
    let timeout_secs = args
        .timeout
        .or_else(|| config.as_ref().and_then(|c| c.timeout_secs))
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let max_workers = args
        .max_workers
        .or_else(|| config.as_ref().and_then(|c| c.max_workers))
        .unwrap_or(DEFAULT_MAX_WORKERS)
        .max(1);
    let budget_threshold = args
        .requests_before_cooldown
        .or_else(|| config.as_ref().and_then(|c| c.requests_before_cooldown))
        .unwrap_or(DEFAULT_REQUESTS_BEFORE_COOLDOWN);
    let cooldown_secs = args
        .cooldown_secs
        .or_else(|| config.as_ref().and_then(|c| c.cooldown_secs))
        .unwrap_or(DEFAULT_COOLDOWN_SECS);
    let retry_count = config
        .as_ref()
        .and_then(|c| c.retry_count)
        .unwrap_or(DEFAULT_RETRY_COUNT)
        .max(1);
    let retry_backoff_secs = config
        .as_ref()
        .and_then(|c| c.retry_backoff_secs.clone())
        .unwrap_or_else(|| vec![1, 2, 4]);
    let user_agent = args
        .user_agent
        .clone()
        .or_else(|| config.as_ref().and_then(|c| c.user_agent.clone()));

    let budget = Arc::new(RequestBudget::new(
        budget_threshold,
        Duration::from_secs(cooldown_secs),
    ));
    let mut builder = BudgetedClient::builder(Arc::clone(&budget))
        .timeout_secs(timeout_secs)
        .retry_count(retry_count)
        .retry_backoff_secs(retry_backoff_secs);
    if let Some(ua) = user_agent {
        builder = builder.user_agent(ua);
    }
    let client = builder.build().map_err(SyncError::Remote)?;

    let store = StateStore::new(output_dir.join(STATE_FILE));
    let reader = Arc::new(HakoReader::new(client));
    let engine = SyncEngine::new(
        Arc::clone(&reader) as _,
        reader as _,
        store.clone(),
        &output_dir,
        max_workers,
    );

    // Ctrl-C stops dispatching new fetches; whatever is in flight is still
    // merged and recorded before exit.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted; finishing in-flight chapters...");
                cancel.cancel();
            }
        });
    }

    let progress_state: Mutex<Option<indicatif::ProgressBar>> = Mutex::new(None);
    let progress_cb = |n: u64, total: u64| {
        if total == 0 {
            return;
        }
        let mut state = match progress_state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let pb = state.get_or_insert_with(|| {
            let bar = indicatif::ProgressBar::new(total);
            if let Ok(style) = indicatif::ProgressStyle::default_bar()
                .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
            {
                bar.set_style(
                    style
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                        .progress_chars("█▉▊▋▌▍▎▏ "),
                );
            }
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        pb.set_position(n);
        pb.set_message(format!("Fetching chapter {}/{}", n, total));
    };
    let phase_cb = |phase: crate::sync::SyncPhase| {
        eprintln!("[{}]", phase);
    };
    let options = SyncOptions {
        chapter_range: match &args.command {
            Command::Chapters { range, .. } => Some(*range),
            _ => None,
        },
        progress: if args.quiet { None } else { Some(&progress_cb) },
        on_phase: if args.verbose { Some(&phase_cb) } else { None },
        cancel: Some(cancel),
    };

    let finish_bar = || {
        if let Ok(mut state) = progress_state.lock() {
            if let Some(pb) = state.take() {
                pb.disable_steady_tick();
                pb.finish_and_clear();
            }
        }
    };

    match &args.command {
        Command::Download { url } | Command::Chapters { url, .. } => {
            let report = engine.sync_title(url, &options).await?;
            finish_bar();
            print_report(&report, args.quiet);
        }
        Command::Update { url } => {
            let normalized = url.trim_end_matches('/');
            if store.load(normalized)?.is_none() {
                return Err(CliRunError::InvalidInput(format!(
                    "{} is not tracked yet. Run 'hakosync download {}' first.",
                    url, url
                )));
            }
            let report = engine.sync_title(url, &options).await?;
            finish_bar();
            print_report(&report, args.quiet);
        }
        Command::UpdateAll => {
            let results = engine.sync_all(&options).await?;
            finish_bar();
            if results.is_empty() {
                eprintln!("No titles tracked yet. Run 'hakosync download <url>' first.");
                return Ok(());
            }
            let mut failures = 0usize;
            for (url, result) in &results {
                match result {
                    Ok(report) => print_report(report, args.quiet),
                    Err(e) => {
                        failures += 1;
                        eprintln!("Error updating {}: {}", url, e);
                        if args.verbose {
                            print_cause_chain(e);
                        }
                    }
                }
            }
            if failures > 0 {
                return Err(CliRunError::InvalidInput(format!(
                    "{} of {} titles failed to update",
                    failures,
                    results.len()
                )));
            }
        }
        Command::List => {
            let records = engine.recorded_titles()?;
            if records.is_empty() {
                eprintln!("No titles tracked yet.");
                return Ok(());
            }
            for record in records {
                let total: usize = record.volumes.iter().map(|v| v.chapters.len()).sum();
                println!(
                    "{}\n  {} ({}/{} chapters, {})",
                    record.name,
                    record.url,
                    record.materialized_count(),
                    total,
                    record.archive_file
                );
            }
        }
    }
    Ok(())
}

fn print_report(report: &TitleReport, quiet: bool) {
    if let Some(old) = &report.renamed_from {
        eprintln!("Note: '{}' was renamed to '{}'.", old, report.name);
    }
    if report.rebuilt {
        eprintln!(
            "Note: archive for '{}' was missing; rebuilding it in full.",
            report.name
        );
    }
    for volume in &report.removed_volumes {
        eprintln!(
            "Note: volume '{}' is no longer listed upstream; local content kept.",
            volume
        );
    }
    if report.up_to_date {
        if !quiet {
            eprintln!("{} is up to date.", report.name);
        }
        return;
    }
    if !quiet {
        eprintln!(
            "Wrote {}: {} new of {} planned chapters.",
            report.archive_path.display(),
            report.embedded,
            report.planned
        );
    }
    for (id, reason) in &report.rejected {
        eprintln!("Warning: chapter {} was rejected: {}", id, reason);
    }
    for (volume, id) in &report.missing {
        eprintln!(
            "Warning: chapter {}/{} was missing from the archive and will be re-downloaded next run.",
            volume, id
        );
    }
    for (id, error) in &report.failed {
        eprintln!(
            "Warning: chapter {} failed and will be retried next run: {}",
            id, error
        );
    }
}

fn print_cause_chain(e: &dyn std::error::Error) {
    let mut source = e.source();
    while let Some(s) = source {
        eprintln!("  cause: {}", s);
        source = s.source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;

    #[test]
    fn parse_chapter_range_valid() {
        assert_eq!(parse_chapter_range("1-10").unwrap(), (1, 10));
        assert_eq!(parse_chapter_range("5-5").unwrap(), (5, 5));
        assert_eq!(parse_chapter_range("  3 - 7  ").unwrap(), (3, 7));
    }

    #[test]
    fn parse_chapter_range_rejects_bad_input() {
        assert!(parse_chapter_range("1").is_err());
        assert!(parse_chapter_range("a-b").is_err());
        assert!(parse_chapter_range("10-1").is_err());
        assert!(parse_chapter_range("0-3").is_err());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(CliRunError::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(
            CliRunError::Sync(SyncError::Remote(RemoteError::NotFound {
                url: "u".into()
            }))
            .exit_code(),
            2
        );
        assert_eq!(
            CliRunError::State(StateError::AlreadySyncing { url: "u".into() }).exit_code(),
            3
        );
    }

    #[test]
    fn args_parse_download() {
        let args = Args::parse_from(["hakosync", "download", "https://ln.hako.vn/truyen/1-t"]);
        assert!(matches!(args.command, Command::Download { .. }));
        assert!(!args.quiet);
    }

    #[test]
    fn args_parse_chapters_with_range() {
        let args = Args::parse_from([
            "hakosync",
            "chapters",
            "https://ln.hako.vn/truyen/1-t",
            "2-9",
        ]);
        match args.command {
            Command::Chapters { range, .. } => assert_eq!(range, (2, 9)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn args_parse_global_flags_after_subcommand() {
        let args = Args::parse_from([
            "hakosync",
            "update-all",
            "--quiet",
            "--max-workers",
            "2",
            "-o",
            "library",
        ]);
        assert!(matches!(args.command, Command::UpdateAll));
        assert!(args.quiet);
        assert_eq!(args.max_workers, Some(2));
        assert_eq!(args.output.as_deref(), Some(std::path::Path::new("library")));
    }
}
