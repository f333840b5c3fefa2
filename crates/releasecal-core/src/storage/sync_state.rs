//! Persisted per-release sync state.
//!
//! One row per release, mutated only by the state machine. Rows are never
//! deleted; `deleted` is a tombstone marking that an external event was
//! intentionally removed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::database::Database;

/// Sync status of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
    Updated,
    Deleted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Updated => "updated",
            SyncStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            "updated" => Some(SyncStatus::Updated),
            "deleted" => Some(SyncStatus::Deleted),
            _ => None,
        }
    }

    /// Whether an external event currently exists in this status.
    pub fn has_external_event(&self) -> bool {
        matches!(self, SyncStatus::Synced | SyncStatus::Updated)
    }
}

/// Sync state of a single release.
///
/// Invariant: `external_event_id.is_some()` iff
/// `status.has_external_event()`. A `failed` row never retains a dangling
/// external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub release_id: i64,
    pub status: SyncStatus,
    pub external_event_id: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    /// Fresh state for a release seen for the first time.
    pub fn pending(release_id: i64) -> Self {
        Self {
            release_id,
            status: SyncStatus::Pending,
            external_event_id: None,
            retry_count: 0,
            last_error: None,
            synced_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Narrow persistence contract for sync state.
pub trait SyncStateStore: Send + Sync {
    fn load(&self, release_id: i64) -> Result<Option<SyncState>, StoreError>;

    /// Load the state for a release, creating a `pending` row on first sight.
    fn load_or_create(&self, release_id: i64) -> Result<SyncState, StoreError>;

    /// Persist a state row (upsert keyed by `release_id`).
    fn save(&self, state: &SyncState) -> Result<(), StoreError>;

    /// Reset a `failed` row back to `pending` with a zeroed retry counter.
    /// Returns false if the row was not eligible.
    fn redrive(&self, release_id: i64) -> Result<bool, StoreError>;

    /// Row counts per status, for operator reporting.
    fn counts_by_status(&self) -> Result<Vec<(SyncStatus, u64)>, StoreError>;
}

/// SQLite-backed sync state store.
pub struct SqliteSyncStateStore {
    db: Arc<Database>,
}

impl SqliteSyncStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<SyncState> {
    let status_str: String = row.get(1)?;
    let status = SyncStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown sync status '{status_str}'").into(),
        )
    })?;
    let synced_at: Option<String> = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(SyncState {
        release_id: row.get(0)?,
        status,
        external_event_id: row.get(2)?,
        retry_count: row.get::<_, i64>(3)? as u32,
        last_error: row.get(4)?,
        synced_at: synced_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        }),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

const STATE_COLUMNS: &str =
    "release_id, status, external_event_id, retry_count, last_error, synced_at, updated_at";

impl SyncStateStore for SqliteSyncStateStore {
    fn load(&self, release_id: i64) -> Result<Option<SyncState>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {STATE_COLUMNS} FROM calendar_metadata WHERE release_id = ?1"),
                params![release_id],
                state_from_row,
            )
            .optional()
        })
    }

    fn load_or_create(&self, release_id: i64) -> Result<SyncState, StoreError> {
        if let Some(state) = self.load(release_id)? {
            return Ok(state);
        }
        let state = SyncState::pending(release_id);
        self.save(&state)?;
        Ok(state)
    }

    fn save(&self, state: &SyncState) -> Result<(), StoreError> {
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calendar_metadata
                   (release_id, status, external_event_id, retry_count, last_error,
                    synced_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(release_id) DO UPDATE SET
                   status = excluded.status,
                   external_event_id = excluded.external_event_id,
                   retry_count = excluded.retry_count,
                   last_error = excluded.last_error,
                   synced_at = excluded.synced_at,
                   updated_at = excluded.updated_at",
                params![
                    state.release_id,
                    state.status.as_str(),
                    state.external_event_id,
                    state.retry_count,
                    state.last_error,
                    state.synced_at.map(|t| t.to_rfc3339()),
                    state.updated_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        });

        // Name the offending id when the unique external-id constraint trips.
        match result {
            Err(StoreError::DuplicateExternalId { .. }) => Err(StoreError::DuplicateExternalId {
                external_event_id: state.external_event_id.clone().unwrap_or_default(),
            }),
            other => other,
        }
    }

    fn redrive(&self, release_id: i64) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE calendar_metadata
                 SET status = 'pending', retry_count = 0, updated_at = ?2
                 WHERE release_id = ?1 AND status = 'failed'",
                params![release_id, now],
            )
        })?;
        Ok(changed > 0)
    }

    fn counts_by_status(&self) -> Result<Vec<(SyncStatus, u64)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM calendar_metadata GROUP BY status ORDER BY status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            let mut counts = Vec::new();
            for row in rows {
                let (status_str, count) = row?;
                if let Some(status) = SyncStatus::parse(&status_str) {
                    counts.push((status, count));
                }
            }
            Ok(counts)
        })
    }
}
