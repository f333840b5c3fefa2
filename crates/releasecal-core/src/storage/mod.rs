pub mod audit;
pub mod database;
pub mod migrations;
pub mod releases;
pub mod sync_state;

pub use audit::{AttemptOutcome, AuditRecord, AuditSink, SqliteAuditSink, SyncType};
pub use database::Database;
pub use releases::{NewRelease, ReleaseRepository, SqliteReleaseRepository};
pub use sync_state::{SqliteSyncStateStore, SyncState, SyncStateStore, SyncStatus};

use std::path::PathBuf;

/// Returns `~/.config/releasecal[-dev]/` based on RELEASECAL_ENV.
///
/// Set RELEASECAL_ENV=dev to use a development data directory.
///
/// # Errors
/// Returns an error if the home directory cannot be determined or if
/// creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("RELEASECAL_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("releasecal-dev")
    } else {
        base_dir.join("releasecal")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
