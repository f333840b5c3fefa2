//! # Releasecal Core Library
//!
//! Core business logic for Releasecal: a sync engine that projects newly
//! discovered work releases (anime episodes, manga volumes) into an
//! external calendar service, surviving transient failures without
//! duplicating or losing external state.
//!
//! ## Architecture
//!
//! - **Sync pipeline**: a batch scheduler fans releases out to a
//!   per-release state machine with bounded concurrency
//! - **Resilience**: per-source sliding-window rate limiting and a
//!   classified retry executor with exponential backoff
//! - **Storage**: SQLite-backed release repository, sync state and an
//!   append-only audit log
//! - **Calendar**: Google Calendar client behind the [`CalendarService`]
//!   trait, with fingerprint-based idempotent creates
//!
//! ## Key Components
//!
//! - [`SyncScheduler`]: batch cycles over the pending backlog
//! - [`SyncStateMachine`]: per-release transitions and persistence
//! - [`RetryExecutor`]: classified, audited, bounded retries
//! - [`RateLimiter`]: per-source admission control
//!
//! [`CalendarService`]: calendar::CalendarService
//! [`SyncScheduler`]: sync::SyncScheduler
//! [`SyncStateMachine`]: sync::SyncStateMachine
//! [`RetryExecutor`]: retry::RetryExecutor
//! [`RateLimiter`]: rate_limiter::RateLimiter

pub mod calendar;
pub mod config;
pub mod error;
pub mod event_builder;
pub mod model;
pub mod rate_limiter;
pub mod retry;
pub mod storage;
pub mod sync;

pub use calendar::{CalendarError, CalendarService, GoogleCalendarService, StaticTokenProvider};
pub use config::Config;
pub use error::{ConfigError, CoreError, StoreError};
pub use event_builder::{build_event, EventPayload};
pub use model::{Release, ReleaseType, Work, WorkKind};
pub use rate_limiter::RateLimiter;
pub use retry::{Classify, ErrorClass, RetryExecutor};
pub use storage::{Database, ReleaseRepository, SyncStateStore, SyncStatus};
pub use sync::{CycleOptions, CycleSummary, SyncOutcome, SyncScheduler, SyncStateMachine};
