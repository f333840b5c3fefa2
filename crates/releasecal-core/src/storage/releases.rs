//! Release repository: the inbound edge of the sync engine.
//!
//! Upstream discovery writes accepted releases here; the engine only reads.
//! `next_pending` is the pull API the scheduler drains: releases that have
//! never been synced (or are still `pending`), plus synced releases whose
//! upstream row changed since the last sync, plus cancelled releases that
//! still hold an external event.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::StoreError;
use crate::model::{Release, ReleaseType, Work, WorkKind};

use super::database::Database;

/// Pull API over accepted releases, ordered soonest-first.
pub trait ReleaseRepository: Send + Sync {
    /// Releases due for a sync action (create, update or delete),
    /// ordered by release date ascending.
    fn next_pending(&self, limit: usize) -> Result<Vec<(Work, Release)>, StoreError>;

    /// Failed releases eligible for re-drive, ordered by release date.
    fn redrivable_failed(&self, limit: usize) -> Result<Vec<(Work, Release)>, StoreError>;

    /// Look up a single release by id.
    fn find(&self, release_id: i64) -> Result<Option<(Work, Release)>, StoreError>;
}

/// A release record to insert, before it has an id.
#[derive(Debug, Clone)]
pub struct NewRelease {
    pub work_id: i64,
    pub work_title: String,
    pub work_kind: WorkKind,
    pub release_type: ReleaseType,
    pub number: u32,
    pub platform: String,
    pub release_date: NaiveDate,
    pub source_url: Option<String>,
}

/// SQLite-backed release repository.
pub struct SqliteReleaseRepository {
    db: Arc<Database>,
}

const WORK_RELEASE_COLUMNS: &str = "r.id, r.work_id, r.work_title, r.work_kind, r.release_type,
     r.number, r.platform, r.release_date, r.source_url, r.cancelled";

fn work_release_from_row(row: &Row<'_>) -> rusqlite::Result<(Work, Release)> {
    let kind_str: String = row.get(3)?;
    let type_str: String = row.get(4)?;
    let date_str: String = row.get(7)?;

    let kind = WorkKind::parse(&kind_str).unwrap_or(WorkKind::Anime);
    let release_type = ReleaseType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown release_type '{type_str}'").into(),
        )
    })?;
    let release_date = date_str.parse::<NaiveDate>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;

    let work = Work {
        id: row.get(1)?,
        title: row.get(2)?,
        kind,
    };
    let release = Release {
        id: row.get(0)?,
        work_id: row.get(1)?,
        release_type,
        number: row.get::<_, i64>(5)? as u32,
        platform: row.get(6)?,
        release_date,
        source_url: row.get(8)?,
        cancelled: row.get::<_, i64>(9)? != 0,
    };
    Ok((work, release))
}

impl SqliteReleaseRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new release. Returns its id.
    ///
    /// # Errors
    /// Returns an error if the natural key already exists.
    pub fn insert(&self, release: &NewRelease) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO releases
                   (work_id, work_title, work_kind, release_type, number, platform,
                    release_date, source_url, cancelled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
                params![
                    release.work_id,
                    release.work_title,
                    release.work_kind.as_str(),
                    release.release_type.as_str(),
                    release.number,
                    release.platform,
                    release.release_date.to_string(),
                    release.source_url,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Mark a release cancelled upstream. The next cycle deletes its event.
    pub fn mark_cancelled(&self, release_id: i64) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE releases SET cancelled = 1, updated_at = ?2 WHERE id = ?1",
                params![release_id, now],
            )
        })?;
        Ok(changed > 0)
    }

    /// Move a release to a new date. The next cycle updates its event.
    pub fn reschedule(&self, release_id: i64, date: NaiveDate) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE releases SET release_date = ?2, updated_at = ?3 WHERE id = ?1",
                params![release_id, date.to_string(), now],
            )
        })?;
        Ok(changed > 0)
    }

    /// All releases, newest date first (operator listing).
    pub fn list(&self, limit: usize) -> Result<Vec<(Work, Release)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WORK_RELEASE_COLUMNS} FROM releases r
                 ORDER BY r.release_date DESC, r.id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], work_release_from_row)?;
            rows.collect()
        })
    }

    fn select_due(
        conn: &Connection,
        where_clause: &str,
        limit: usize,
    ) -> rusqlite::Result<Vec<(Work, Release)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORK_RELEASE_COLUMNS} FROM releases r
             LEFT JOIN calendar_metadata m ON m.release_id = r.id
             WHERE {where_clause}
             ORDER BY r.release_date ASC, r.id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], work_release_from_row)?;
        rows.collect()
    }
}

impl ReleaseRepository for SqliteReleaseRepository {
    fn next_pending(&self, limit: usize) -> Result<Vec<(Work, Release)>, StoreError> {
        self.db.with_conn(|conn| {
            Self::select_due(
                conn,
                // never-synced or still-pending releases, synced releases the
                // upstream has touched since, and cancelled releases whose
                // external event still exists
                "(r.cancelled = 0 AND (m.release_id IS NULL OR m.status = 'pending'))
                 OR (r.cancelled = 0 AND m.status IN ('synced', 'updated')
                     AND r.updated_at > m.updated_at)
                 OR (r.cancelled = 1 AND m.status IN ('synced', 'updated'))",
                limit,
            )
        })
    }

    fn redrivable_failed(&self, limit: usize) -> Result<Vec<(Work, Release)>, StoreError> {
        self.db.with_conn(|conn| {
            Self::select_due(conn, "r.cancelled = 0 AND m.status = 'failed'", limit)
        })
    }

    fn find(&self, release_id: i64) -> Result<Option<(Work, Release)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WORK_RELEASE_COLUMNS} FROM releases r WHERE r.id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![release_id], work_release_from_row)?;
            rows.next().transpose()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_release(work_id: i64, number: u32, date: &str) -> NewRelease {
        NewRelease {
            work_id,
            work_title: format!("Work {work_id}"),
            work_kind: WorkKind::Anime,
            release_type: ReleaseType::Episode,
            number,
            platform: "X".to_string(),
            release_date: date.parse().unwrap(),
            source_url: None,
        }
    }

    fn repo() -> SqliteReleaseRepository {
        SqliteReleaseRepository::new(Arc::new(Database::open_memory().unwrap()))
    }

    #[test]
    fn insert_and_find() {
        let repo = repo();
        let id = repo.insert(&new_release(1, 5, "2025-12-20")).unwrap();

        let (work, release) = repo.find(id).unwrap().unwrap();
        assert_eq!(work.id, 1);
        assert_eq!(work.title, "Work 1");
        assert_eq!(release.number, 5);
        assert_eq!(release.fingerprint(), "1-episode-5");
        assert!(!release.cancelled);
    }

    #[test]
    fn duplicate_natural_key_rejected() {
        let repo = repo();
        repo.insert(&new_release(1, 5, "2025-12-20")).unwrap();
        assert!(repo.insert(&new_release(1, 5, "2025-12-20")).is_err());
    }

    #[test]
    fn next_pending_orders_by_date_ascending() {
        let repo = repo();
        repo.insert(&new_release(1, 3, "2025-12-22")).unwrap();
        repo.insert(&new_release(1, 1, "2025-12-20")).unwrap();
        repo.insert(&new_release(1, 2, "2025-12-21")).unwrap();

        let due = repo.next_pending(10).unwrap();
        let numbers: Vec<u32> = due.iter().map(|(_, r)| r.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn next_pending_respects_limit() {
        let repo = repo();
        for n in 1..=5 {
            repo.insert(&new_release(1, n, "2025-12-20")).unwrap();
        }
        assert_eq!(repo.next_pending(2).unwrap().len(), 2);
    }

    #[test]
    fn next_pending_skips_cancelled_without_event() {
        let repo = repo();
        let id = repo.insert(&new_release(1, 1, "2025-12-20")).unwrap();
        repo.mark_cancelled(id).unwrap();
        assert!(repo.next_pending(10).unwrap().is_empty());
    }

    #[test]
    fn find_missing_returns_none() {
        assert!(repo().find(999).unwrap().is_none());
    }
}
