//! CloudPull command-line entry point.
//!
//! Thin wiring around the engine: parse arguments, open the database,
//! build the remote client from `CLOUDPULL_TOKEN`, run the requested
//! lifecycle operation, and render progress from the event bus.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use cloudpull_core::{
    Database, DriveClient, Event, EventBus, SessionStatus, StateStore, SyncConfig, SyncEngine,
};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let db = Database::new(&cli.db)
        .await
        .with_context(|| format!("opening database {}", cli.db.display()))?;
    let store = StateStore::new(db);

    match cli.command {
        Command::Start {
            root_id,
            destination,
        } => {
            let engine = build_engine(store, config)?;
            let session_id = engine.start(&root_id, destination).await?;
            println!("session {session_id} started");
            run_to_completion(&engine).await?;
        }
        Command::Resume { session_id } => {
            let engine = build_engine(store, config)?;
            engine.resume(session_id).await?;
            println!("session {session_id} resumed");
            run_to_completion(&engine).await?;
        }
        Command::Status { session_id } => {
            print_status(&store, session_id).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "cloudpull=debug" } else { "cloudpull=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(store: StateStore, config: SyncConfig) -> anyhow::Result<SyncEngine> {
    let token = std::env::var("CLOUDPULL_TOKEN")
        .context("CLOUDPULL_TOKEN must hold a valid API access token")?;
    let client = Arc::new(DriveClient::new(token)?);
    Ok(SyncEngine::new(store, client, EventBus::new(), config))
}

/// Drives the progress line and waits for the run to end; Ctrl-C requests
/// a graceful stop (partial transfers stay resumable).
async fn run_to_completion(engine: &SyncEngine) -> anyhow::Result<()> {
    let mut events = engine.events().channel("cli-progress", 256);
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    let progress_bar = bar.clone();
    let ui = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Event::SessionUpdate(s) = event {
                progress_bar.set_message(format!(
                    "[{}/{}] {} / {} bytes, {} B/s, {} failed, {} skipped",
                    s.completed_files,
                    s.total_files,
                    s.completed_bytes,
                    s.total_bytes,
                    s.current_speed_bps,
                    s.failed_files,
                    s.skipped_files,
                ));
            }
        }
    });

    let status = tokio::select! {
        status = engine.wait_for_completion() => status?,
        _ = tokio::signal::ctrl_c() => {
            bar.set_message("stopping...".to_string());
            engine.stop().await?;
            engine.wait_for_completion().await.unwrap_or(SessionStatus::Cancelled)
        }
    };

    bar.finish_and_clear();
    ui.abort();
    println!("session finished: {status}");
    if status == SessionStatus::Failed {
        bail!("session ended with failures");
    }
    Ok(())
}

async fn print_status(store: &StateStore, session_id: Option<i64>) -> anyhow::Result<()> {
    match session_id {
        Some(id) => {
            let session = store.sessions().get(id).await?;
            let (files_pct, bytes_pct, duration) = store.sessions().summary(id).await?;
            println!("session {} [{}]", session.id, session.status());
            println!("  root: {} -> {}", session.root_folder_name, session.destination_path);
            println!(
                "  files: {}/{} ({files_pct:.1}%), failed {}, skipped {}",
                session.completed_files,
                session.total_files,
                session.failed_files,
                session.skipped_files
            );
            println!(
                "  bytes: {}/{} ({bytes_pct:.1}%), {duration}s elapsed",
                session.completed_bytes, session.total_bytes
            );
            let errors = store.errors().recent(id, 5).await?;
            if !errors.is_empty() {
                println!("  recent errors:");
                for error in errors {
                    println!("    [{}] {}", error.error_kind, error.error_message);
                }
            }
        }
        None => {
            let sessions = store.sessions().list().await?;
            if sessions.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            for session in sessions {
                println!(
                    "{}  {}  {}/{} files  {}",
                    session.id,
                    session.status(),
                    session.completed_files,
                    session.total_files,
                    session.root_folder_name
                );
            }
        }
    }
    Ok(())
}
