//! Batch scheduler: fans pending releases out to the state machine.
//!
//! Each cycle pulls a date-ordered batch of due releases and dispatches
//! them to a semaphore-bounded worker set. One release's failure never
//! aborts the others; a panicking worker is contained by the task join and
//! counted as a failure.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::CoreError;
use crate::storage::releases::ReleaseRepository;
use crate::storage::sync_state::SyncStateStore;
use crate::sync::state_machine::SyncStateMachine;
use crate::sync::types::CycleSummary;

/// Per-cycle overrides.
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Override the configured batch size.
    pub batch_size: Option<usize>,
    /// Re-drive failed releases into this cycle.
    pub include_failed: bool,
}

/// Runs sync cycles over the pending backlog.
pub struct SyncScheduler {
    repo: Arc<dyn ReleaseRepository>,
    store: Arc<dyn SyncStateStore>,
    machine: Arc<SyncStateMachine>,
    config: SchedulerConfig,
}

impl SyncScheduler {
    pub fn new(
        repo: Arc<dyn ReleaseRepository>,
        store: Arc<dyn SyncStateStore>,
        machine: Arc<SyncStateMachine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            store,
            machine,
            config,
        }
    }

    /// Run one sync cycle.
    ///
    /// Dispatch order is release-date ascending: the soonest releases get
    /// their events first, even when a deadline or shutdown cuts the cycle
    /// short. `shutdown` cancels between retry attempts, never mid-call.
    pub async fn run_cycle(
        &self,
        options: &CycleOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<CycleSummary, CoreError> {
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size);

        if options.include_failed {
            for (_, release) in self.repo.redrivable_failed(batch_size)? {
                if self.store.redrive(release.id)? {
                    info!(release_id = release.id, "re-driving failed release");
                }
            }
        }

        let batch = self.repo.next_pending(batch_size)?;
        info!(batch = batch.len(), "sync cycle starting");

        let (effective_rx, deadline_task) = self.with_deadline(shutdown);

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut summary = CycleSummary::default();

        let mut batch_iter = batch.into_iter();
        while let Some((work, release)) = batch_iter.next() {
            if *effective_rx.borrow() {
                summary.skipped += 1 + batch_iter.len();
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let machine = Arc::clone(&self.machine);
            let rx = effective_rx.clone();
            tasks.spawn(async move {
                let outcome = machine.sync_release(&work, &release, &rx).await;
                drop(permit);
                (release.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => summary.record(outcome),
                Ok((release_id, Err(e))) => {
                    warn!(release_id, error = %e, "sync failed with engine error");
                    summary.failed += 1;
                }
                Err(join_error) => {
                    warn!(error = %join_error, "sync worker panicked");
                    summary.failed += 1;
                }
            }
        }

        if let Some(task) = deadline_task {
            task.abort();
        }

        info!(%summary, "sync cycle finished");
        Ok(summary)
    }

    /// Merge the caller's shutdown signal with the configured cycle
    /// deadline. Without a deadline the caller's receiver is used as-is.
    fn with_deadline(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> (watch::Receiver<bool>, Option<tokio::task::JoinHandle<()>>) {
        let Some(deadline) = self.config.cycle_deadline() else {
            return (shutdown, None);
        };

        let (cycle_tx, cycle_rx) = watch::channel(false);
        let mut caller_rx = shutdown;
        let task = tokio::spawn(async move {
            let deadline_sleep = tokio::time::sleep(deadline);
            tokio::pin!(deadline_sleep);
            let mut caller_alive = true;
            loop {
                tokio::select! {
                    _ = &mut deadline_sleep => {
                        warn!(?deadline, "cycle deadline reached, cancelling");
                        let _ = cycle_tx.send(true);
                        break;
                    }
                    changed = caller_rx.changed(), if caller_alive => {
                        match changed {
                            Ok(()) if *caller_rx.borrow() => {
                                let _ = cycle_tx.send(true);
                                break;
                            }
                            Ok(()) => {}
                            // Caller gone; only the deadline can stop us now.
                            Err(_) => caller_alive = false,
                        }
                    }
                }
            }
        });
        (cycle_rx, Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::storage::sync_state::SyncStatus;
    use crate::sync::testing::{engine, engine_with, MockFailure, TestEngineOptions};

    fn shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn cycle_creates_all_pending() {
        let engine = engine();
        engine.add_release(1, 1, "2025-12-20");
        engine.add_release(1, 2, "2025-12-21");
        engine.add_release(2, 1, "2025-12-22");

        let (_tx, rx) = shutdown();
        let summary = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx)
            .await
            .unwrap();

        assert_eq!(summary.created, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(engine.calendar.event_count(), 3);
    }

    #[tokio::test]
    async fn dispatch_order_is_date_ascending() {
        // Single worker so start order is observable in the call log.
        let engine = engine_with(TestEngineOptions {
            concurrency: 1,
            ..Default::default()
        });
        engine.add_release(1, 3, "2025-12-23");
        engine.add_release(1, 1, "2025-12-20");
        engine.add_release(1, 2, "2025-12-21");

        let (_tx, rx) = shutdown();
        engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx)
            .await
            .unwrap();

        let finds: Vec<String> = engine
            .calendar
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("find:"))
            .collect();
        assert_eq!(finds, vec!["find:1-episode-1", "find:1-episode-2", "find:1-episode-3"]);
    }

    #[tokio::test]
    async fn one_permanent_failure_does_not_poison_the_batch() {
        let engine = engine();
        engine.add_release(1, 1, "2025-12-20");
        let bad = engine.add_release(1, 2, "2025-12-21");
        engine.add_release(1, 3, "2025-12-22");
        engine.add_release(1, 4, "2025-12-23");
        engine
            .calendar
            .fail_next("1-episode-2", vec![MockFailure::Permanent]);

        let (_tx, rx) = shutdown();
        let summary = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx)
            .await
            .unwrap();

        assert_eq!(summary.created, 3);
        assert_eq!(summary.failed, 1);
        let state = engine.state_of(bad);
        assert_eq!(state.status, SyncStatus::Failed);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn batch_size_bounds_the_cycle() {
        let engine = engine();
        for n in 1..=5 {
            engine.add_release(1, n, "2025-12-20");
        }

        let (_tx, rx) = shutdown();
        let summary = engine
            .scheduler
            .run_cycle(
                &CycleOptions {
                    batch_size: Some(2),
                    include_failed: false,
                },
                rx,
            )
            .await
            .unwrap();

        assert_eq!(summary.created, 2);
        assert_eq!(engine.calendar.event_count(), 2);
    }

    #[tokio::test]
    async fn include_failed_redrives_and_retries() {
        let engine = engine();
        let id = engine.add_release(1, 1, "2025-12-20");
        engine.calendar.fail_next(
            "1-episode-1",
            vec![
                MockFailure::Transient,
                MockFailure::Transient,
                MockFailure::Transient,
            ],
        );

        let (_tx, rx) = shutdown();
        let summary = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx.clone())
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(engine.state_of(id).status, SyncStatus::Failed);

        // Without include_failed the release stays failed.
        let summary = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx.clone())
            .await
            .unwrap();
        assert_eq!(summary.total(), 0);

        // Re-driven, the (now unscripted) create succeeds.
        let summary = engine
            .scheduler
            .run_cycle(
                &CycleOptions {
                    batch_size: None,
                    include_failed: true,
                },
                rx,
            )
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
        let state = engine.state_of(id);
        assert_eq!(state.status, SyncStatus::Synced);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test]
    async fn shutdown_before_dispatch_skips_everything() {
        let engine = engine();
        for n in 1..=3 {
            engine.add_release(1, n, "2025-12-20");
        }

        let (tx, rx) = shutdown();
        tx.send(true).unwrap();
        let summary = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.created, 0);
        assert_eq!(engine.calendar.event_count(), 0);
    }

    #[tokio::test]
    async fn deadline_cancels_mid_cycle_without_corrupting_state() {
        // Transient failures plus a long backoff: the worker is parked in
        // its backoff sleep when the 50ms deadline fires.
        let engine = engine_with(TestEngineOptions {
            concurrency: 1,
            retry: RetryConfig {
                max_retries: 5,
                base_backoff_ms: 5_000,
                max_backoff_ms: 5_000,
                rate_limit_cooldown_ms: 5_000,
            },
            cycle_deadline_ms: 50,
        });
        let id = engine.add_release(1, 1, "2025-12-20");
        engine.calendar.fail_next(
            "1-episode-1",
            vec![MockFailure::Transient, MockFailure::Transient],
        );

        let (_tx, rx) = shutdown();
        let summary = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx)
            .await
            .unwrap();

        // The in-flight create was cancelled, not guessed as synced.
        assert_eq!(summary.skipped, 1);
        let state = engine.state_of(id);
        assert_eq!(state.status, SyncStatus::Pending);
        assert_eq!(state.retry_count, 0);
        assert!(state.external_event_id.is_none());

        // Audit cross-check: no successful create was recorded.
        let records = engine.audit.records_for_release(id).unwrap();
        assert!(records
            .iter()
            .all(|r| r.outcome == crate::storage::audit::AttemptOutcome::Failure));
    }

    #[tokio::test]
    async fn second_cycle_is_a_noop_when_nothing_changed() {
        let engine = engine();
        engine.add_release(1, 1, "2025-12-20");

        let (_tx, rx) = shutdown();
        let first = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx.clone())
            .await
            .unwrap();
        assert_eq!(first.created, 1);

        let second = engine
            .scheduler
            .run_cycle(&CycleOptions::default(), rx)
            .await
            .unwrap();
        assert_eq!(second.total(), 0);
        assert_eq!(engine.calendar.event_count(), 1);
    }
}
