//! Archive Agent - Main entry point
//!
//! Archives the configured trees once or on a fixed interval.

use anyhow::Result;
use archive_agent::daemon::schedule::{Exit, Scheduler};
use archive_agent::daemon::shutdown::ShutdownCoordinator;
use archive_agent::utils::format::format_bytes;
use archive_agent::{config::Config, utils, BackupRunner};
use chrono::{TimeZone, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run a single pass and exit (overrides config)
    #[arg(long)]
    once: bool,

    /// List existing archives per job and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration errors end the process before any job runs
    let config = Config::from_file(&args.config)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let runner = BackupRunner::from_config(&config);

    if args.list {
        print_listing(&runner);
        return Ok(());
    }

    runner.prepare_matchers()?;

    let names: Vec<&str> = runner.jobs().iter().map(|j| j.name.as_str()).collect();
    tracing::info!(
        "Starting archive-agent v{}, every {}s, preparing to archive: {}",
        env!("CARGO_PKG_VERSION"),
        config.interval,
        names.join(", ")
    );

    let run_once = args.once || config.run_once;
    let period = Duration::from_secs(config.interval.max(1));

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());
    let scheduler = Scheduler::new(Arc::new(runner), period);
    let shutdown_rx = shutdown_coordinator.subscribe();

    let signal_coordinator = Arc::clone(&shutdown_coordinator);
    let signal_task = tokio::spawn(async move {
        signal_coordinator.wait_for_signal().await;
    });

    let exit = scheduler.run(run_once, shutdown_rx).await;
    signal_task.abort();

    match exit? {
        Exit::Completed | Exit::Shutdown => Ok(()),
        Exit::Interrupted => std::process::exit(1),
    }
}

fn print_listing(runner: &BackupRunner) {
    for (job, evaluation) in runner.evaluate() {
        let evaluation = match evaluation {
            Ok(evaluation) => evaluation,
            Err(e) => {
                println!("{}: {}", job, e);
                continue;
            }
        };

        println!("{} ({} archives)", job, evaluation.archives.len());
        for archive in &evaluation.archives {
            let created = Utc
                .timestamp_opt(archive.timestamp, 0)
                .single()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| archive.timestamp.to_string());
            let marker = if evaluation.would_evict.contains(archive) {
                "  [evict]"
            } else {
                ""
            };
            println!(
                "  {}  {}  {}{}",
                archive.file_name,
                created,
                format_bytes(archive.size),
                marker
            );
        }
        if evaluation.newest_is_duplicate == Some(true) {
            println!("  newest archive is identical to the previous one");
        }
    }
}
