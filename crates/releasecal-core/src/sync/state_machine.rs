//! Per-release sync state machine.
//!
//! Orchestrates the event builder, retry executor, state store and audit
//! sink for a single release. Transitions:
//!
//! | from            | event                        | to        |
//! |-----------------|------------------------------|-----------|
//! | pending         | create succeeds              | synced    |
//! | pending         | create fails, retries left   | pending   |
//! | pending         | retries exhausted/permanent  | failed    |
//! | synced/updated  | content changed, update ok   | updated   |
//! | synced/updated  | update fails (retryable)     | unchanged |
//! | synced/updated  | cancelled, delete succeeds   | deleted   |
//! | failed          | re-drive                     | pending   |
//!
//! Before any create, the machine looks the release's fingerprint up in the
//! external service and adopts a matching event instead of creating a
//! duplicate. That lookup is what makes creates idempotent across crashes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::calendar::{CalendarError, CalendarService};
use crate::error::CoreError;
use crate::event_builder::{build_event, EventPayload};
use crate::model::{Release, Work};
use crate::retry::{AttemptInfo, RetryError, RetryExecutor};
use crate::storage::audit::{AttemptOutcome, AuditRecord, AuditSink, SyncType};
use crate::storage::sync_state::{SyncState, SyncStateStore, SyncStatus};
use crate::sync::types::SyncOutcome;

/// Drives one release through its sync transitions.
pub struct SyncStateMachine {
    store: Arc<dyn SyncStateStore>,
    audit: Arc<dyn AuditSink>,
    calendar: Arc<dyn CalendarService>,
    executor: RetryExecutor,
    source_key: String,
    /// Per-release locks: one SyncState row is never mutated by two workers.
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncStateMachine {
    pub fn new(
        store: Arc<dyn SyncStateStore>,
        audit: Arc<dyn AuditSink>,
        calendar: Arc<dyn CalendarService>,
        executor: RetryExecutor,
        source_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            audit,
            calendar,
            executor,
            source_key: source_key.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, release_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        Arc::clone(locks.entry(release_id).or_default())
    }

    /// Append an audit record, never failing the sync that produced it.
    ///
    /// A failed append is retried once in the background and then dropped.
    fn record_attempt(&self, record: &AuditRecord) {
        if let Err(e) = self.audit.append(record) {
            warn!(
                release_id = record.release_id,
                error = %e,
                "audit append failed; retrying in background"
            );
            let audit = Arc::clone(&self.audit);
            let record = record.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Err(e) = audit.append(&record) {
                    warn!(
                        release_id = record.release_id,
                        error = %e,
                        "audit append retry failed; dropping record"
                    );
                }
            });
        }
    }

    /// Sync one release to the external calendar.
    ///
    /// Returns the outcome; calendar failures are absorbed into the
    /// persisted state and reported as [`SyncOutcome::Failed`]. Only
    /// engine-local store errors propagate as `Err`.
    pub async fn sync_release(
        &self,
        work: &Work,
        release: &Release,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SyncOutcome, CoreError> {
        let lock = self.lock_for(release.id);
        let _guard = lock.lock().await;

        let state = self.store.load_or_create(release.id)?;

        match state.status {
            SyncStatus::Deleted => Ok(SyncOutcome::Skipped),
            // A failed row needs an explicit re-drive before another attempt.
            SyncStatus::Failed => Ok(SyncOutcome::Skipped),
            SyncStatus::Pending => {
                if release.cancelled {
                    // Cancelled before anything external existed.
                    Ok(SyncOutcome::Skipped)
                } else {
                    self.create_flow(work, release, state, shutdown).await
                }
            }
            SyncStatus::Synced | SyncStatus::Updated => {
                let Some(external_id) = state.external_event_id.clone() else {
                    // Should be unreachable: the store invariant ties an
                    // external id to these statuses. Recover by recreating.
                    warn!(release_id = release.id, "synced state without external id");
                    return self.create_flow(work, release, state, shutdown).await;
                };
                if release.cancelled {
                    self.delete_flow(work, release, state, external_id, shutdown)
                        .await
                } else {
                    self.update_flow(work, release, state, external_id, shutdown)
                        .await
                }
            }
        }
    }

    async fn create_flow(
        &self,
        work: &Work,
        release: &Release,
        mut state: SyncState,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SyncOutcome, CoreError> {
        let payload = build_event(work, release);
        let fingerprint = payload.fingerprint.clone();

        let op = || {
            let calendar = Arc::clone(&self.calendar);
            let payload = payload.clone();
            let fingerprint = fingerprint.clone();
            async move {
                // Mandatory idempotency check: a prior attempt may have
                // created the event without the result being recorded.
                if let Some(existing) = calendar.find_event_by_fingerprint(&fingerprint).await? {
                    debug!(fingerprint = %fingerprint, existing = %existing, "adopting existing event");
                    return Ok(existing);
                }
                calendar.create_event(&payload).await
            }
        };
        let resolve = || {
            let calendar = Arc::clone(&self.calendar);
            let fingerprint = fingerprint.clone();
            async move { calendar.find_event_by_fingerprint(&fingerprint).await }
        };

        let max_retries = self.executor.max_retries();
        let mut observer = |info: AttemptInfo<'_, String, CalendarError>| {
            self.record_attempt(&AuditRecord {
                release_id: release.id,
                work_id: work.id,
                external_event_id: info.result.ok().cloned(),
                outcome: attempt_outcome(info.result.is_ok()),
                sync_type: SyncType::Create,
                error_message: info.result.err().map(|e| e.to_string()),
                attempt: info.attempt,
                max_retries,
                synced_at: info.result.is_ok().then(Utc::now),
                duration: info.duration,
            });
        };

        let result = self
            .executor
            .execute(&self.source_key, shutdown, op, resolve, &mut observer)
            .await;

        match result {
            Ok(event_id) => {
                info!(release_id = release.id, event_id = %event_id, "release synced");
                state.status = SyncStatus::Synced;
                state.external_event_id = Some(event_id);
                state.retry_count = 0;
                state.last_error = None;
                state.synced_at = Some(Utc::now());
                state.updated_at = Utc::now();
                self.store.save(&state)?;
                Ok(SyncOutcome::Created)
            }
            Err(RetryError::Cancelled) => Ok(SyncOutcome::Cancelled),
            Err(RetryError::Failed { source, attempts }) => {
                warn!(release_id = release.id, error = %source, attempts, "create failed");
                state.status = SyncStatus::Failed;
                state.external_event_id = None;
                state.retry_count = attempts;
                state.last_error = Some(source.to_string());
                state.updated_at = Utc::now();
                self.store.save(&state)?;
                Ok(SyncOutcome::Failed)
            }
        }
    }

    async fn update_flow(
        &self,
        work: &Work,
        release: &Release,
        mut state: SyncState,
        external_id: String,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SyncOutcome, CoreError> {
        let payload = build_event(work, release);

        let op = || {
            let calendar = Arc::clone(&self.calendar);
            let payload: EventPayload = payload.clone();
            let external_id = external_id.clone();
            async move { calendar.update_event(&external_id, &payload).await }
        };

        let max_retries = self.executor.max_retries();
        let mut observer = |info: AttemptInfo<'_, (), CalendarError>| {
            self.record_attempt(&AuditRecord {
                release_id: release.id,
                work_id: work.id,
                external_event_id: Some(external_id.clone()),
                outcome: attempt_outcome(info.result.is_ok()),
                sync_type: SyncType::Update,
                error_message: info.result.err().map(|e| e.to_string()),
                attempt: info.attempt,
                max_retries,
                synced_at: info.result.is_ok().then(Utc::now),
                duration: info.duration,
            });
        };

        let result = self
            .executor
            .execute(
                &self.source_key,
                shutdown,
                op,
                no_resolution,
                &mut observer,
            )
            .await;

        match result {
            Ok(()) => {
                info!(release_id = release.id, external_id = %external_id, "release updated");
                state.status = SyncStatus::Updated;
                state.retry_count = 0;
                state.last_error = None;
                state.synced_at = Some(Utc::now());
                state.updated_at = Utc::now();
                self.store.save(&state)?;
                Ok(SyncOutcome::Updated)
            }
            Err(RetryError::Cancelled) => Ok(SyncOutcome::Cancelled),
            Err(RetryError::Failed {
                source: CalendarError::EventNotFound(_),
                ..
            }) => {
                // The event vanished externally; recreate on the next cycle.
                warn!(release_id = release.id, external_id = %external_id, "event gone, recreating");
                state.status = SyncStatus::Pending;
                state.external_event_id = None;
                state.retry_count = 0;
                state.last_error = Some(format!("event {external_id} no longer exists"));
                state.updated_at = Utc::now();
                self.store.save(&state)?;
                Ok(SyncOutcome::Failed)
            }
            Err(RetryError::Failed { source, attempts }) => {
                // Keep the existing event valid; status stays synced/updated.
                // The row timestamp is left alone so the release is still
                // selected as changed on the next cycle.
                warn!(release_id = release.id, error = %source, "update failed");
                state.retry_count += attempts;
                state.last_error = Some(source.to_string());
                self.store.save(&state)?;
                Ok(SyncOutcome::Failed)
            }
        }
    }

    async fn delete_flow(
        &self,
        work: &Work,
        release: &Release,
        mut state: SyncState,
        external_id: String,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SyncOutcome, CoreError> {
        let op = || {
            let calendar = Arc::clone(&self.calendar);
            let external_id = external_id.clone();
            async move {
                match calendar.delete_event(&external_id).await {
                    // Already gone: the tombstone outcome is identical.
                    Err(CalendarError::EventNotFound(_)) => Ok(()),
                    other => other,
                }
            }
        };

        let max_retries = self.executor.max_retries();
        let mut observer = |info: AttemptInfo<'_, (), CalendarError>| {
            self.record_attempt(&AuditRecord {
                release_id: release.id,
                work_id: work.id,
                external_event_id: Some(external_id.clone()),
                outcome: attempt_outcome(info.result.is_ok()),
                sync_type: SyncType::Delete,
                error_message: info.result.err().map(|e| e.to_string()),
                attempt: info.attempt,
                max_retries,
                synced_at: None,
                duration: info.duration,
            });
        };

        let result = self
            .executor
            .execute(
                &self.source_key,
                shutdown,
                op,
                no_resolution,
                &mut observer,
            )
            .await;

        match result {
            Ok(()) => {
                info!(release_id = release.id, external_id = %external_id, "event deleted");
                state.status = SyncStatus::Deleted;
                state.external_event_id = None;
                state.retry_count = 0;
                state.last_error = None;
                state.updated_at = Utc::now();
                self.store.save(&state)?;
                Ok(SyncOutcome::Deleted)
            }
            Err(RetryError::Cancelled) => Ok(SyncOutcome::Cancelled),
            Err(RetryError::Failed { source, attempts }) => {
                warn!(release_id = release.id, error = %source, "delete failed");
                state.retry_count += attempts;
                state.last_error = Some(source.to_string());
                state.updated_at = Utc::now();
                self.store.save(&state)?;
                Ok(SyncOutcome::Failed)
            }
        }
    }
}

fn attempt_outcome(success: bool) -> AttemptOutcome {
    if success {
        AttemptOutcome::Success
    } else {
        AttemptOutcome::Failure
    }
}

/// Resolver for operations that are safe to retry blindly.
async fn no_resolution() -> Result<Option<()>, CalendarError> {
    Ok(None)
}
