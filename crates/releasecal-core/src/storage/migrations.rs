//! Database schema migrations for releasecal.
//!
//! Migrations are versioned and applied automatically when opening the
//! database. The `schema_version` table tracks the current version.

use rusqlite::{Connection, Result as SqliteResult};

/// Apply all pending migrations to bring the database to the current schema
/// version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Create the schema_version table if it doesn't exist.
fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration v1: releases, sync state and audit log tables.
///
/// - `releases`: repository-owned release records, denormalized with their
///   work's title and kind. Natural key is unique.
/// - `calendar_metadata`: one sync-state row per release. `release_id` and
///   `external_event_id` are both unique -- at most one active sync state
///   per release, and no two releases may claim the same external event.
/// - `calendar_sync_log`: append-only record of every sync attempt.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS releases (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            work_id       INTEGER NOT NULL,
            work_title    TEXT NOT NULL,
            work_kind     TEXT NOT NULL DEFAULT 'anime',
            release_type  TEXT NOT NULL,
            number        INTEGER NOT NULL,
            platform      TEXT NOT NULL,
            release_date  TEXT NOT NULL,
            source_url    TEXT,
            cancelled     INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            UNIQUE (work_id, release_type, number, platform, release_date)
        );

        CREATE TABLE IF NOT EXISTS calendar_metadata (
            release_id         INTEGER NOT NULL UNIQUE REFERENCES releases(id),
            status             TEXT NOT NULL DEFAULT 'pending',
            external_event_id  TEXT UNIQUE,
            retry_count        INTEGER NOT NULL DEFAULT 0,
            last_error         TEXT,
            synced_at          TEXT,
            updated_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS calendar_sync_log (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            release_id         INTEGER NOT NULL,
            work_id            INTEGER NOT NULL,
            external_event_id  TEXT,
            sync_status        TEXT NOT NULL,
            sync_type          TEXT NOT NULL,
            error_message      TEXT,
            retry_count        INTEGER NOT NULL,
            max_retries        INTEGER NOT NULL,
            synced_at          TEXT,
            duration_ms        INTEGER NOT NULL,
            created_at         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_releases_release_date ON releases(release_date);
        CREATE INDEX IF NOT EXISTS idx_releases_cancelled ON releases(cancelled);
        CREATE INDEX IF NOT EXISTS idx_calendar_metadata_status ON calendar_metadata(status);
        CREATE INDEX IF NOT EXISTS idx_sync_log_release
            ON calendar_sync_log(release_id, created_at);",
    )?;

    set_schema_version(conn, 1)
}

/// Migration v2: operator-facing status view.
///
/// Joins each release's current sync state with its most recent audit
/// attempt, so "why hasn't X synced" is a single query.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE VIEW IF NOT EXISTS sync_status_overview AS
         SELECT
             r.id            AS release_id,
             r.work_id       AS work_id,
             r.work_title    AS work_title,
             r.release_type  AS release_type,
             r.number        AS number,
             r.platform      AS platform,
             r.release_date  AS release_date,
             r.cancelled     AS cancelled,
             m.status            AS status,
             m.external_event_id AS external_event_id,
             m.retry_count       AS retry_count,
             m.last_error        AS last_error,
             m.synced_at         AS synced_at,
             l.sync_type     AS last_attempt_type,
             l.sync_status   AS last_attempt_status,
             l.error_message AS last_attempt_error,
             l.created_at    AS last_attempt_at
         FROM releases r
         LEFT JOIN calendar_metadata m ON m.release_id = r.id
         LEFT JOIN calendar_sync_log l ON l.id = (
             SELECT id FROM calendar_sync_log
             WHERE release_id = r.id
             ORDER BY created_at DESC, id DESC
             LIMIT 1
         );",
    )?;

    set_schema_version(conn, 2)
}
