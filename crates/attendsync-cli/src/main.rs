//! attendsync - command-line front end for the offline attendance cache.
//!
//! Inspects the local cache, runs push/pull syncs against the remote store,
//! audits drift between the two, and can stay running to mirror realtime
//! changes while syncing periodically.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use attendsync_core::utils::{format_age, format_local_time, truncate_string};
use attendsync_core::{
    Config, DataIntegrityChecker, LocalCacheStore, PhoenixFeed, RealtimeListener, RemoteStore,
    SupabaseClient, SyncOrchestrator,
};

// ============================================================================
// Constants
// ============================================================================

/// File name prefix of the rolling log written in watch mode
const LOG_FILE_PREFIX: &str = "attendsync.log";

/// Recent scans shown by `status`
const RECENT_SCANS: usize = 5;

const USAGE: &str = "\
Usage: attendsync <command> [--json]

Commands:
  status   Show cache contents and sync state (default)
  sync     Push local records, then pull remote data
  push     Push local-only records to the remote store
  pull     Replace synced records with remote data
  check    Compare local and remote record counts
  watch    Mirror realtime changes and sync periodically until Ctrl-C
  clear    Delete the local cache";

/// Initialize the tracing subscriber for logging.
/// When `log_dir` is given, events are also written to a daily rolling file.
fn init_tracing(default_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("status");
    let as_json = args.iter().skip(2).any(|a| a == "--json");

    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = if command == "watch" {
        let dir = config.data_dir()?;
        std::fs::create_dir_all(&dir)?;
        init_tracing("info", Some(&dir))
    } else {
        init_tracing("warn", None)
    };
    info!(command, "attendsync starting");

    let store = Arc::new(LocalCacheStore::from_config(&config)?);

    match command {
        "status" => cmd_status(&config, &store, as_json).await,
        "sync" => cmd_sync(&config, &store, as_json).await,
        "push" => cmd_push(&config, &store).await,
        "pull" => cmd_pull(&config, &store).await,
        "check" => cmd_check(&config, &store, as_json).await,
        "watch" => cmd_watch(&config, store).await,
        "clear" => {
            store.clear().await?;
            println!("Local cache cleared.");
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn orchestrator(config: &Config, store: &Arc<LocalCacheStore>) -> Result<SyncOrchestrator> {
    let client = SupabaseClient::from_config(config)?;
    Ok(SyncOrchestrator::new(Arc::new(client), Arc::clone(store)))
}

async fn cmd_status(config: &Config, store: &LocalCacheStore, as_json: bool) -> Result<()> {
    let data = store.read().await;
    let unsynced = store.unsynced_counts().await;

    if as_json {
        let status = json!({
            "library": config.library,
            "backend": store.active_backend(),
            "remoteConfigured": config.remote_credentials().is_some(),
            "students": data.students.len(),
            "attendanceRecords": data.attendance_records.len(),
            "unsyncedStudents": unsynced.students,
            "unsyncedRecords": unsynced.records,
            "lastSync": data.last_sync,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let last_sync = match data.last_sync {
        Some(at) => format!("{} ({})", format_local_time(at), format_age(at, Utc::now())),
        None => "never".to_string(),
    };
    println!("Library:     {}", config.library.as_deref().unwrap_or("(all)"));
    println!("Storage:     {} in {}", store.active_backend(), config.data_dir()?.display());
    println!(
        "Remote:      {}",
        if config.remote_credentials().is_some() { "configured" } else { "not configured" }
    );
    println!("Students:    {} ({} unsynced)", data.students.len(), unsynced.students);
    println!("Attendance:  {} ({} unsynced)", data.attendance_records.len(), unsynced.records);
    println!("Last sync:   {}", last_sync);

    if !data.attendance_records.is_empty() {
        println!("\nRecent scans:");
        for record in data.attendance_records.iter().take(RECENT_SCANS) {
            let marker = if record.is_local_only() { "*" } else { " " };
            println!(
                " {} {}  {:<9}  {:<10}  {}",
                marker,
                format_local_time(record.timestamp),
                record.kind.as_str(),
                record.student_id,
                truncate_string(&record.student_name, 32)
            );
        }
        if unsynced.records > 0 {
            println!("(* not yet synced)");
        }
    }
    Ok(())
}

async fn cmd_sync(config: &Config, store: &Arc<LocalCacheStore>, as_json: bool) -> Result<()> {
    let report = orchestrator(config, store)?.force_sync().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Pushed {} students and {} attendance records.",
            report.pushed.students_added, report.pushed.records_added
        );
        println!(
            "Cache now holds {} students and {} attendance records.",
            report.students, report.attendance_records
        );
    }
    Ok(())
}

async fn cmd_push(config: &Config, store: &Arc<LocalCacheStore>) -> Result<()> {
    let summary = orchestrator(config, store)?.push_local_to_remote().await?;
    println!(
        "Pushed {} students and {} attendance records.",
        summary.students_added, summary.records_added
    );
    Ok(())
}

async fn cmd_pull(config: &Config, store: &Arc<LocalCacheStore>) -> Result<()> {
    let data = orchestrator(config, store)?.pull_remote_to_local().await?;
    println!(
        "Pulled {} students and {} attendance records ({} local records still unsynced).",
        data.students.len(),
        data.attendance_records.len(),
        data.unsynced_records()
    );
    Ok(())
}

async fn cmd_check(config: &Config, store: &Arc<LocalCacheStore>, as_json: bool) -> Result<()> {
    let remote = match SupabaseClient::from_config(config) {
        Ok(client) => Some(Arc::new(client) as Arc<dyn RemoteStore>),
        Err(e) => {
            warn!(error = %e, "Checking local data only");
            None
        }
    };
    let report = DataIntegrityChecker::new(Arc::clone(store), remote)
        .with_backlog_threshold(config.unsynced_backlog_threshold)
        .check()
        .await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let remote_count = |count: Option<u64>| count.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
    println!("Local records:     {}", report.local_records);
    println!("Remote records:    {}", remote_count(report.supabase_records));
    println!("Synced / unsynced: {} / {}", report.synced_records, report.unsynced_records);
    println!(
        "Yesterday:         {} local, {} remote",
        report.yesterday_local,
        remote_count(report.yesterday_remote)
    );
    if report.is_healthy() {
        println!("\nNo issues found.");
    } else {
        println!("\nIssues:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
    }
    Ok(())
}

async fn cmd_watch(config: &Config, store: Arc<LocalCacheStore>) -> Result<()> {
    let client = SupabaseClient::from_config(config)?;
    let feed = PhoenixFeed::for_client(&client, config.library.clone());
    let sync = SyncOrchestrator::new(Arc::new(client), Arc::clone(&store));

    let mut listener = RealtimeListener::new(Arc::clone(&store)).on_change(|students, records| {
        info!(students = students.len(), records = records.len(), "Cache updated from realtime change");
    });
    if let Err(e) = listener.start(&feed).await {
        warn!(error = %e, "Realtime unavailable, relying on periodic sync");
        eprintln!("Realtime unavailable ({}); syncing periodically only.", e);
    }

    let interval = Duration::from_secs(config.sync_interval_secs);
    sync.start(interval);
    println!(
        "Watching for changes, syncing every {}s. Press Ctrl-C to stop.",
        interval.as_secs()
    );

    tokio::signal::ctrl_c().await?;

    sync.stop();
    listener.destroy().await;
    let status = sync.status().await;
    if let Some(error) = status.last_error {
        println!("Last sync error: {}", error);
    }
    println!("Stopped.");
    Ok(())
}
