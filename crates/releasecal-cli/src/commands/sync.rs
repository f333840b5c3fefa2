//! Sync subcommand: run cycles, inspect status, re-drive failures.

use std::sync::Arc;

use clap::Subcommand;
use releasecal_core::calendar::{GoogleCalendarService, StaticTokenProvider};
use releasecal_core::config::Config;
use releasecal_core::rate_limiter::RateLimiter;
use releasecal_core::retry::RetryExecutor;
use releasecal_core::storage::audit::{load_overview, SqliteAuditSink};
use releasecal_core::storage::releases::{ReleaseRepository, SqliteReleaseRepository};
use releasecal_core::storage::sync_state::{SqliteSyncStateStore, SyncStateStore};
use releasecal_core::storage::Database;
use releasecal_core::sync::{CycleOptions, SyncScheduler, SyncStateMachine};

/// Environment variable holding the calendar API bearer token.
const TOKEN_ENV: &str = "RELEASECAL_ACCESS_TOKEN";

/// Sync actions.
#[derive(Subcommand)]
pub enum SyncAction {
    /// Run one sync cycle over the pending backlog
    Run {
        /// Maximum releases to process this cycle
        #[arg(long)]
        batch_size: Option<usize>,
        /// Re-drive failed releases into this cycle
        #[arg(long)]
        include_failed: bool,
    },
    /// Show per-release sync status
    Status {
        /// Narrow to a single release
        #[arg(long)]
        release_id: Option<i64>,
        /// Maximum rows to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Reset failed releases back to pending
    Redrive {
        /// Release to re-drive
        #[arg(long, conflicts_with = "all")]
        release_id: Option<i64>,
        /// Re-drive every failed release
        #[arg(long)]
        all: bool,
    },
}

/// Run the sync command.
pub async fn run(action: SyncAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        SyncAction::Run {
            batch_size,
            include_failed,
        } => run_cycle(batch_size, include_failed).await,
        SyncAction::Status { release_id, limit } => show_status(release_id, limit),
        SyncAction::Redrive { release_id, all } => redrive(release_id, all),
    }
}

async fn run_cycle(
    batch_size: Option<usize>,
    include_failed: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let token = std::env::var(TOKEN_ENV)
        .map_err(|_| format!("{TOKEN_ENV} is not set; export a calendar API token first"))?;

    let db = Arc::new(Database::open()?);
    let repo = Arc::new(SqliteReleaseRepository::new(Arc::clone(&db)));
    let store = Arc::new(SqliteSyncStateStore::new(Arc::clone(&db)));
    let audit = Arc::new(SqliteAuditSink::new(Arc::clone(&db)));

    let calendar = Arc::new(GoogleCalendarService::new(
        config.calendar.calendar_id.clone(),
        Arc::new(StaticTokenProvider::new(token)),
        config.scheduler.per_call_timeout(),
    ));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let executor = RetryExecutor::new(config.retry.clone(), limiter);
    let machine = Arc::new(SyncStateMachine::new(
        store.clone() as Arc<dyn SyncStateStore>,
        audit,
        calendar,
        executor,
        "google",
    ));
    let scheduler = SyncScheduler::new(
        repo as Arc<dyn ReleaseRepository>,
        store as Arc<dyn SyncStateStore>,
        machine,
        config.scheduler.clone(),
    );

    // Ctrl-C cancels between attempts; in-flight state stays consistent.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("shutting down after in-flight work settles...");
            let _ = shutdown_tx.send(true);
        }
    });

    let options = CycleOptions {
        batch_size,
        include_failed,
    };
    let summary = scheduler.run_cycle(&options, shutdown_rx).await?;
    println!("Sync cycle: {summary}");
    Ok(())
}

fn show_status(
    release_id: Option<i64>,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open()?);
    let store = SqliteSyncStateStore::new(Arc::clone(&db));

    let counts = store.counts_by_status()?;
    if counts.is_empty() {
        println!("No releases have been selected for sync yet.");
    } else {
        let line = counts
            .iter()
            .map(|(status, count)| format!("{} {}", status.as_str(), count))
            .collect::<Vec<_>>()
            .join(", ");
        println!("Totals: {line}");
    }
    println!();

    let rows = load_overview(&db, release_id, limit)?;
    if rows.is_empty() {
        println!("No matching releases.");
        return Ok(());
    }

    for row in rows {
        let status = row.status.as_deref().unwrap_or("new");
        println!(
            "#{} {} {} {} [{}] on {} - {}",
            row.release_id,
            row.work_title,
            row.release_type,
            row.number,
            row.platform,
            row.release_date,
            status,
        );
        if let Some(event_id) = &row.external_event_id {
            println!("    event: {event_id}");
        }
        if let Some(attempt) = &row.last_attempt_type {
            println!(
                "    last attempt: {} {} at {}",
                attempt,
                row.last_attempt_status.as_deref().unwrap_or("?"),
                row.last_attempt_at.as_deref().unwrap_or("?"),
            );
        }
        if let Some(error) = &row.last_error {
            println!("    last error: {error}");
        }
    }
    Ok(())
}

fn redrive(release_id: Option<i64>, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open()?);
    let store = SqliteSyncStateStore::new(Arc::clone(&db));
    let repo = SqliteReleaseRepository::new(db);

    match (release_id, all) {
        (Some(id), false) => {
            if store.redrive(id)? {
                println!("Release #{id} reset to pending.");
            } else {
                println!("Release #{id} is not in a failed state.");
            }
        }
        (None, true) => {
            let failed = repo.redrivable_failed(10_000)?;
            let mut count = 0;
            for (_, release) in failed {
                if store.redrive(release.id)? {
                    count += 1;
                }
            }
            println!("Re-drove {count} failed release(s).");
        }
        _ => {
            return Err("pass either --release-id <id> or --all".into());
        }
    }
    Ok(())
}
