use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use harvest_core::config::DEFAULT_RUN_MODE;
use harvest_core::logging::{init_logging, LogLevel};
use harvest_core::{
    discover_targets, CommandExtractor, Config, FileStorage, Orchestrator, RunParameters,
    RunReport, SessionManager, Storage,
};
use tracing::warn;

mod progress;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Resumable batch secret recovery driven by an external search engine", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract and search every target under a path, resuming today's session if one exists
    Run {
        /// File or directory holding the targets
        target: PathBuf,
        /// Search-space mask (overrides engine.mask)
        #[arg(long)]
        mask: Option<String>,
        /// Start over instead of resuming
        #[arg(long)]
        fresh: bool,
    },
    /// Show a stored session
    Status {
        session_id: String,
    },
    /// List stored sessions
    List,
    /// Delete finished sessions older than the retention window
    Cleanup {
        /// Retention in days (overrides session.retention_days)
        #[arg(long)]
        days: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if cli.verbose {
        config.logging.level = LogLevel::Debug;
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run {
            target,
            mask,
            fresh,
        } => run(config, target, mask, fresh).await,
        Commands::Status { session_id } => status(&config, &session_id),
        Commands::List => list(&config),
        Commands::Cleanup { days } => cleanup(&config, days),
        Commands::Config => {
            print!("{}", config.to_toml_string());
            Ok(())
        }
    }
}

async fn run(mut config: Config, target: PathBuf, mask: Option<String>, fresh: bool) -> Result<()> {
    if let Some(mask) = mask {
        config.engine.mask = mask;
    }

    let targets = discover_targets(&target, &config.pool.target_extensions);
    if targets.is_empty() {
        bail!("No targets found under {}", target.display());
    }

    let params = RunParameters::for_root(&target, &config.engine.mask, DEFAULT_RUN_MODE)
        .wrap_err_with(|| format!("Cannot resolve {}", target.display()))?
        .with_option("hash_mode", &config.engine.hash_mode)
        .with_option("attack_mode", &config.engine.attack_mode);

    let manager = SessionManager::with_interval(
        FileStorage::with_config(config.storage.clone()),
        config.session.autosave_interval(),
    );
    let extractor = CommandExtractor::from_config(&config.extractor, config.pool.task_timeout());
    let mut orchestrator = Orchestrator::new(manager, &config, Arc::new(extractor));

    let (mut session, resumed) = orchestrator.open(params, targets, fresh)?;
    if resumed {
        println!(
            "Resuming session {} ({}/{} finished)",
            session.session_id,
            session.finished_count(),
            session.total()
        );
    } else {
        println!(
            "Started session {} with {} targets",
            session.session_id,
            session.total()
        );
    }

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let bar = progress::create_search_progress();
    let report = orchestrator
        .run(&mut session, |snapshot| progress::apply_snapshot(&bar, snapshot))
        .await;
    bar.finish_and_clear();
    let report = report?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;
    println!();
    println!("Session {}", report.session_id);
    if report.restored {
        println!("  Engine resumed from its checkpoint");
    }
    println!("  Engine:    {}", report.engine_state());
    println!("  Completed: {}", summary.completed);
    println!("  Failed:    {}", summary.failed);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Remaining: {}", summary.pending);
    println!("  Total:     {}", summary.total);

    if let Some(Err(e)) = report.engine.clone().map(|outcome| outcome.into_result()) {
        warn!(error = %e, "Engine run failed");
        eprintln!("Engine error: {e}");
    }

    let unfinished = summary.pending > 0 && !report.engine_state().is_finished_search();
    if report.interrupted || unfinished {
        println!();
        println!("Progress was saved. Re-run with the same parameters to resume.");
    }
}

fn status(config: &Config, session_id: &str) -> Result<()> {
    // Read-only: a live run may still hold tasks in processing.
    let storage = FileStorage::with_config(config.storage.clone());
    let session = storage
        .load_session(session_id)
        .map_err(|e| eyre!("Cannot read session {session_id}: {e}"))?;
    let summary = session.summary();

    println!("Session {}", summary.session_id);
    println!("  Target:    {}", summary.run_parameters.target);
    println!("  Mask:      {}", summary.run_parameters.mask);
    println!("  Created:   {}", summary.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "  Progress:  {}/{} ({:.1}%)",
        session.finished_count(),
        summary.total,
        session.progress_percent()
    );
    println!(
        "  Completed: {}  Failed: {}  Skipped: {}",
        summary.completed, summary.failed, summary.skipped
    );
    if let Some(eta) = session.estimated_completion {
        println!("  ETA:       {}", eta.format("%Y-%m-%d %H:%M:%S"));
    }

    if !summary.results.is_empty() {
        println!();
        println!("Recovered:");
        for entry in &summary.results {
            let alias = entry
                .result
                .credential
                .as_ref()
                .map(|c| format!(" (alias {})", c.primary_alias))
                .unwrap_or_default();
            println!(
                "  {}  {}{}",
                entry.target_path.display(),
                entry.result.secret,
                alias
            );
        }
    }
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let manager = SessionManager::new(FileStorage::with_config(config.storage.clone()));
    let sessions = manager.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions found. Use 'harvest run <path>' to start one.");
        return Ok(());
    }

    for info in sessions {
        let state = if info.is_finished() { "finished" } else { "open" };
        println!(
            "{}  {:>5}/{:<5} {:<8} {}  {}",
            info.session_id,
            info.finished,
            info.total,
            state,
            info.updated_at.format("%Y-%m-%d %H:%M"),
            info.target
        );
    }
    Ok(())
}

fn cleanup(config: &Config, days: Option<u64>) -> Result<()> {
    let retention = days
        .map(|d| Duration::from_secs(d * 24 * 60 * 60))
        .unwrap_or_else(|| config.session.retention());

    let mut manager = SessionManager::new(FileStorage::with_config(config.storage.clone()));
    let removed = manager.cleanup_finished(retention)?;
    println!("Removed {removed} finished session(s)");
    Ok(())
}
