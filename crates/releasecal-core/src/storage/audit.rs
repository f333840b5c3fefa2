//! Append-only audit trail of sync attempts.
//!
//! One record per remote attempt, written before the attempt's outcome is
//! acted on, so the trail survives a crash of the caller. Records are never
//! updated or deleted -- the log, not the sync state, is the ground truth
//! for "what happened".

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::database::Database;

/// Remote operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Create,
    Update,
    Delete,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Create => "create",
            SyncType::Update => "update",
            SyncType::Delete => "delete",
        }
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
        }
    }
}

/// One sync attempt, as recorded in `calendar_sync_log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub release_id: i64,
    pub work_id: i64,
    pub external_event_id: Option<String>,
    pub outcome: AttemptOutcome,
    pub sync_type: SyncType,
    pub error_message: Option<String>,
    /// 1-based attempt number within the sync call.
    pub attempt: u32,
    pub max_retries: u32,
    pub synced_at: Option<DateTime<Utc>>,
    pub duration: Duration,
}

/// Write-once audit contract.
///
/// Append failures must never fail the sync that produced the record; the
/// state machine logs and drops them.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), StoreError>;
}

/// SQLite-backed audit sink writing to `calendar_sync_log`.
pub struct SqliteAuditSink {
    db: Arc<Database>,
}

impl SqliteAuditSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// All attempts recorded for a release, oldest first.
    pub fn records_for_release(&self, release_id: i64) -> Result<Vec<AuditRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT release_id, work_id, external_event_id, sync_status, sync_type,
                        error_message, retry_count, max_retries, synced_at, duration_ms
                 FROM calendar_sync_log
                 WHERE release_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![release_id], record_from_row)?;
            rows.collect()
        })
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let outcome_str: String = row.get(3)?;
    let type_str: String = row.get(4)?;
    let synced_at: Option<String> = row.get(8)?;

    let outcome = match outcome_str.as_str() {
        "success" => AttemptOutcome::Success,
        _ => AttemptOutcome::Failure,
    };
    let sync_type = match type_str.as_str() {
        "update" => SyncType::Update,
        "delete" => SyncType::Delete,
        _ => SyncType::Create,
    };

    Ok(AuditRecord {
        release_id: row.get(0)?,
        work_id: row.get(1)?,
        external_event_id: row.get(2)?,
        outcome,
        sync_type,
        error_message: row.get(5)?,
        attempt: row.get::<_, i64>(6)? as u32,
        max_retries: row.get::<_, i64>(7)? as u32,
        synced_at: synced_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        }),
        duration: Duration::from_millis(row.get::<_, i64>(9)? as u64),
    })
}

impl AuditSink for SqliteAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calendar_sync_log
                   (release_id, work_id, external_event_id, sync_status, sync_type,
                    error_message, retry_count, max_retries, synced_at, duration_ms,
                    created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.release_id,
                    record.work_id,
                    record.external_event_id,
                    record.outcome.as_str(),
                    record.sync_type.as_str(),
                    record.error_message,
                    record.attempt,
                    record.max_retries,
                    record.synced_at.map(|t| t.to_rfc3339()),
                    record.duration.as_millis() as i64,
                    now,
                ],
            )
            .map(|_| ())
        })
    }
}

/// One row of the operator-facing `sync_status_overview` view.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOverviewRow {
    pub release_id: i64,
    pub work_title: String,
    pub release_type: String,
    pub number: u32,
    pub platform: String,
    pub release_date: String,
    pub status: Option<String>,
    pub external_event_id: Option<String>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
    pub last_attempt_type: Option<String>,
    pub last_attempt_status: Option<String>,
    pub last_attempt_at: Option<String>,
}

/// Query the overview view, optionally narrowed to one release.
pub fn load_overview(
    db: &Database,
    release_id: Option<i64>,
    limit: usize,
) -> Result<Vec<SyncOverviewRow>, StoreError> {
    db.with_conn(|conn| {
        let mut sql = String::from(
            "SELECT release_id, work_title, release_type, number, platform, release_date,
                    status, external_event_id, retry_count, last_error,
                    last_attempt_type, last_attempt_status, last_attempt_at
             FROM sync_status_overview",
        );
        if release_id.is_some() {
            sql.push_str(" WHERE release_id = ?1 ORDER BY release_date ASC, release_id ASC LIMIT ?2");
        } else {
            sql.push_str(" ORDER BY release_date ASC, release_id ASC LIMIT ?1");
        }

        let map_row = |row: &Row<'_>| -> rusqlite::Result<SyncOverviewRow> {
            Ok(SyncOverviewRow {
                release_id: row.get(0)?,
                work_title: row.get(1)?,
                release_type: row.get(2)?,
                number: row.get::<_, i64>(3)? as u32,
                platform: row.get(4)?,
                release_date: row.get(5)?,
                status: row.get(6)?,
                external_event_id: row.get(7)?,
                retry_count: row.get::<_, Option<i64>>(8)?.map(|n| n as u32),
                last_error: row.get(9)?,
                last_attempt_type: row.get(10)?,
                last_attempt_status: row.get(11)?,
                last_attempt_at: row.get(12)?,
            })
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = match release_id {
            Some(id) => stmt.query_map(params![id, limit as i64], map_row)?,
            None => stmt.query_map(params![limit as i64], map_row)?,
        };
        rows.collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(release_id: i64, attempt: u32, outcome: AttemptOutcome) -> AuditRecord {
        AuditRecord {
            release_id,
            work_id: 1,
            external_event_id: matches!(outcome, AttemptOutcome::Success)
                .then(|| "evt_abc".to_string()),
            outcome,
            sync_type: SyncType::Create,
            error_message: matches!(outcome, AttemptOutcome::Failure)
                .then(|| "timeout".to_string()),
            attempt,
            max_retries: 3,
            synced_at: None,
            duration: Duration::from_millis(120),
        }
    }

    #[test]
    fn append_and_read_back() {
        let db = Arc::new(Database::open_memory().unwrap());
        let sink = SqliteAuditSink::new(db);

        sink.append(&record(1, 1, AttemptOutcome::Failure)).unwrap();
        sink.append(&record(1, 2, AttemptOutcome::Success)).unwrap();
        sink.append(&record(2, 1, AttemptOutcome::Success)).unwrap();

        let records = sink.records_for_release(1).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempt, 1);
        assert_eq!(records[0].outcome, AttemptOutcome::Failure);
        assert_eq!(records[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(records[1].outcome, AttemptOutcome::Success);
        assert_eq!(records[1].external_event_id.as_deref(), Some("evt_abc"));
        assert_eq!(records[1].duration, Duration::from_millis(120));
    }

    #[test]
    fn overview_joins_state_and_latest_attempt() {
        let db = Arc::new(Database::open_memory().unwrap());

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO releases
                   (id, work_id, work_title, work_kind, release_type, number, platform,
                    release_date, cancelled, created_at, updated_at)
                 VALUES (1, 1, 'Work 1', 'anime', 'episode', 5, 'X',
                         '2025-12-20', 0, '2025-12-01T00:00:00Z', '2025-12-01T00:00:00Z')",
                [],
            )?;
            conn.execute(
                "INSERT INTO calendar_metadata
                   (release_id, status, external_event_id, retry_count, updated_at)
                 VALUES (1, 'failed', NULL, 3, '2025-12-02T00:00:00Z')",
                [],
            )
            .map(|_| ())
        })
        .unwrap();

        let sink = SqliteAuditSink::new(Arc::clone(&db));
        sink.append(&record(1, 3, AttemptOutcome::Failure)).unwrap();

        let rows = load_overview(&db, Some(1), 10).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.work_title, "Work 1");
        assert_eq!(row.status.as_deref(), Some("failed"));
        assert_eq!(row.retry_count, Some(3));
        assert_eq!(row.last_attempt_type.as_deref(), Some("create"));
        assert_eq!(row.last_attempt_status.as_deref(), Some("failure"));
    }

    #[test]
    fn overview_includes_never_synced_releases() {
        let db = Arc::new(Database::open_memory().unwrap());
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO releases
                   (id, work_id, work_title, work_kind, release_type, number, platform,
                    release_date, cancelled, created_at, updated_at)
                 VALUES (1, 1, 'Work 1', 'anime', 'episode', 1, 'X',
                         '2025-12-20', 0, '2025-12-01T00:00:00Z', '2025-12-01T00:00:00Z')",
                [],
            )
            .map(|_| ())
        })
        .unwrap();

        let rows = load_overview(&db, None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].status.is_none());
        assert!(rows[0].last_attempt_at.is_none());
    }
}
