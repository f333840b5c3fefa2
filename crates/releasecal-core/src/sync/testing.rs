//! Shared test fixtures for the sync pipeline: an in-memory fake calendar
//! and a fully wired engine over an in-memory database.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::calendar::{CalendarError, CalendarService};
use crate::config::{RateLimitConfig, RetryConfig, SchedulerConfig, SourceLimit};
use crate::event_builder::EventPayload;
use crate::model::{ReleaseType, WorkKind};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryExecutor;
use crate::storage::audit::SqliteAuditSink;
use crate::storage::releases::{NewRelease, ReleaseRepository, SqliteReleaseRepository};
use crate::storage::sync_state::{SqliteSyncStateStore, SyncState, SyncStateStore};
use crate::storage::Database;
use crate::sync::scheduler::SyncScheduler;
use crate::sync::state_machine::SyncStateMachine;

/// Scripted failure for the fake calendar.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MockFailure {
    /// 503 from the service.
    Transient,
    /// 400 from the service.
    Permanent,
    /// 429 from the service.
    RateLimited,
    /// The request "times out" after the event was actually created:
    /// the caller sees an ambiguous error, the event exists server-side.
    AmbiguousButCreated,
}

/// In-memory fake of the external calendar.
///
/// Behaviour is scripted per fingerprint: queued failures are consumed one
/// per attempt, after which operations succeed. Every call is recorded for
/// assertions.
pub(crate) struct MockCalendarService {
    /// external id -> fingerprint
    events: Mutex<HashMap<String, String>>,
    script: Mutex<HashMap<String, VecDeque<MockFailure>>>,
    next_id: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl MockCalendarService {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            script: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue failures for the next attempts touching `fingerprint`.
    pub(crate) fn fail_next(&self, fingerprint: &str, failures: Vec<MockFailure>) {
        self.script
            .lock()
            .unwrap()
            .entry(fingerprint.to_string())
            .or_default()
            .extend(failures);
    }

    /// Plant an already-existing external event (e.g. a create whose result
    /// was never recorded locally).
    pub(crate) fn seed_event(&self, fingerprint: &str) -> String {
        let id = format!("evt_seeded_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.events
            .lock()
            .unwrap()
            .insert(id.clone(), fingerprint.to_string());
        id
    }

    pub(crate) fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub(crate) fn has_fingerprint(&self, fingerprint: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .values()
            .any(|fp| fp == fingerprint)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_failure(&self, fingerprint: &str) -> Option<MockFailure> {
        self.script
            .lock()
            .unwrap()
            .get_mut(fingerprint)
            .and_then(|queue| queue.pop_front())
    }

    fn apply_failure(&self, fingerprint: &str) -> Result<(), CalendarError> {
        match self.next_failure(fingerprint) {
            None => Ok(()),
            Some(MockFailure::Transient) => Err(CalendarError::Api {
                status: 503,
                message: "scripted transient failure".to_string(),
            }),
            Some(MockFailure::Permanent) => Err(CalendarError::Api {
                status: 400,
                message: "scripted permanent failure".to_string(),
            }),
            Some(MockFailure::RateLimited) => {
                Err(CalendarError::RateLimited { retry_after: None })
            }
            Some(MockFailure::AmbiguousButCreated) => {
                let id = format!("evt_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                self.events
                    .lock()
                    .unwrap()
                    .insert(id, fingerprint.to_string());
                Err(CalendarError::AmbiguousTimeout)
            }
        }
    }
}

#[async_trait]
impl CalendarService for MockCalendarService {
    async fn create_event(&self, payload: &EventPayload) -> Result<String, CalendarError> {
        self.log(format!("create:{}", payload.fingerprint));
        self.apply_failure(&payload.fingerprint)?;
        let id = format!("evt_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.events
            .lock()
            .unwrap()
            .insert(id.clone(), payload.fingerprint.clone());
        Ok(id)
    }

    async fn update_event(
        &self,
        external_id: &str,
        payload: &EventPayload,
    ) -> Result<(), CalendarError> {
        self.log(format!("update:{external_id}"));
        self.apply_failure(&payload.fingerprint)?;
        if !self.events.lock().unwrap().contains_key(external_id) {
            return Err(CalendarError::EventNotFound(external_id.to_string()));
        }
        Ok(())
    }

    async fn delete_event(&self, external_id: &str) -> Result<(), CalendarError> {
        self.log(format!("delete:{external_id}"));
        let fingerprint = self.events.lock().unwrap().get(external_id).cloned();
        if let Some(fp) = &fingerprint {
            self.apply_failure(fp)?;
        }
        match self.events.lock().unwrap().remove(external_id) {
            Some(_) => Ok(()),
            None => Err(CalendarError::EventNotFound(external_id.to_string())),
        }
    }

    async fn find_event_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<String>, CalendarError> {
        self.log(format!("find:{fingerprint}"));
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .find(|(_, fp)| fp.as_str() == fingerprint)
            .map(|(id, _)| id.clone()))
    }
}

/// Knobs for [`engine_with`].
pub(crate) struct TestEngineOptions {
    pub(crate) concurrency: usize,
    pub(crate) retry: RetryConfig,
    pub(crate) cycle_deadline_ms: u64,
}

impl Default for TestEngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryConfig::testing(),
            cycle_deadline_ms: 0,
        }
    }
}

/// Fully wired engine over an in-memory database and the fake calendar.
pub(crate) struct TestEngine {
    pub(crate) db: Arc<Database>,
    pub(crate) repo: Arc<SqliteReleaseRepository>,
    pub(crate) store: Arc<SqliteSyncStateStore>,
    pub(crate) audit: Arc<SqliteAuditSink>,
    pub(crate) calendar: Arc<MockCalendarService>,
    pub(crate) machine: Arc<SyncStateMachine>,
    pub(crate) scheduler: SyncScheduler,
}

impl TestEngine {
    /// Insert an accepted episode release and return its id.
    pub(crate) fn add_release(&self, work_id: i64, number: u32, date: &str) -> i64 {
        self.repo
            .insert(&NewRelease {
                work_id,
                work_title: format!("Work {work_id}"),
                work_kind: WorkKind::Anime,
                release_type: ReleaseType::Episode,
                number,
                platform: "X".to_string(),
                release_date: date.parse().unwrap(),
                source_url: None,
            })
            .unwrap()
    }

    pub(crate) fn state_of(&self, release_id: i64) -> SyncState {
        self.store.load(release_id).unwrap().unwrap()
    }

    /// Sync one release directly through the state machine.
    pub(crate) async fn sync_one(&self, release_id: i64) -> crate::sync::types::SyncOutcome {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let (work, release) = self.repo.find(release_id).unwrap().unwrap();
        self.machine
            .sync_release(&work, &release, &rx)
            .await
            .unwrap()
    }
}

pub(crate) fn engine() -> TestEngine {
    engine_with(TestEngineOptions::default())
}

pub(crate) fn engine_with(options: TestEngineOptions) -> TestEngine {
    let db = Arc::new(Database::open_memory().unwrap());
    let repo = Arc::new(SqliteReleaseRepository::new(Arc::clone(&db)));
    let store = Arc::new(SqliteSyncStateStore::new(Arc::clone(&db)));
    let audit = Arc::new(SqliteAuditSink::new(Arc::clone(&db)));
    let calendar = Arc::new(MockCalendarService::new());

    // Generous window so rate limiting never throttles unit tests.
    let rate_limit = RateLimitConfig {
        default: SourceLimit {
            max_calls: 1_000,
            window_seconds: 1,
        },
        sources: HashMap::new(),
    };
    let limiter = Arc::new(RateLimiter::new(rate_limit));
    let executor = RetryExecutor::new(options.retry, limiter);

    let machine = Arc::new(SyncStateMachine::new(
        Arc::clone(&store) as Arc<dyn SyncStateStore>,
        Arc::clone(&audit) as Arc<dyn crate::storage::audit::AuditSink>,
        Arc::clone(&calendar) as Arc<dyn CalendarService>,
        executor,
        "google",
    ));

    let scheduler_config = SchedulerConfig {
        batch_size: 50,
        concurrency: options.concurrency,
        per_call_timeout_ms: 5_000,
        cycle_deadline_ms: options.cycle_deadline_ms,
    };
    let scheduler = SyncScheduler::new(
        Arc::clone(&repo) as Arc<dyn ReleaseRepository>,
        Arc::clone(&store) as Arc<dyn SyncStateStore>,
        Arc::clone(&machine),
        scheduler_config,
    );

    TestEngine {
        db,
        repo,
        store,
        audit,
        calendar,
        machine,
        scheduler,
    }
}
