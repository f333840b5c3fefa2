//! Bounded-retry execution of remote calls.
//!
//! [`RetryExecutor`] wraps a single remote operation with rate-limit
//! admission, error classification, exponential backoff and an audit
//! observer. Retry policy is an explicit value composed around a call-site
//! closure, so it can be configured and tested in isolation.
//!
//! Classification:
//! - `Transient`: retry with `base * 2^n` backoff (capped, jittered), up to
//!   `max_retries` budget-consuming failures.
//! - `RateLimited`: the service told us to slow down; wait the advertised
//!   cool-down and retry WITHOUT consuming the retry budget.
//! - `Permanent`: surfaced immediately.
//! - `Ambiguous`: the outcome is unknown server-side (e.g. timeout after
//!   send); the caller's resolver decides whether the call actually
//!   succeeded. Never blind-retried: an unresolved ambiguous attempt is
//!   downgraded to `Transient`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RetryConfig;
use crate::rate_limiter::RateLimiter;

/// Retry classification of a remote error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    RateLimited,
    Permanent,
    Ambiguous,
}

/// Implemented by remote error types so the executor can classify them.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Server-advertised cool-down for `RateLimited` errors, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// What the executor observed about one attempt.
///
/// Reported before `execute` returns, success or failure, so the audit
/// trail is independent of whether the caller survives.
pub struct AttemptInfo<'r, T, E> {
    /// 1-based attempt number, counting every remote call made.
    pub attempt: u32,
    pub duration: Duration,
    pub result: Result<&'r T, &'r E>,
}

/// Terminal outcome of an exhausted or aborted retry loop.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Shutdown observed between attempts; no further calls were made.
    #[error("cancelled before completion")]
    Cancelled,

    /// Permanent error, or transient retries exhausted.
    #[error("{source}")]
    Failed {
        source: E,
        /// Budget-consuming failed attempts (excludes rate-limit waits).
        attempts: u32,
    },
}

/// Executes one remote operation under rate-limit admission and bounded
/// retry.
pub struct RetryExecutor {
    config: RetryConfig,
    limiter: Arc<RateLimiter>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, limiter: Arc<RateLimiter>) -> Self {
        Self { config, limiter }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Run `op` to completion under the retry policy.
    ///
    /// `resolve` is consulted only for `Ambiguous` failures: `Ok(Some(v))`
    /// means the operation actually succeeded server-side and `v` is
    /// accepted as the result. `observer` sees every attempt.
    ///
    /// Cancellation is observed between attempts, never mid-call; a
    /// cancelled execution reports [`RetryError::Cancelled`] without
    /// consuming further budget.
    pub async fn execute<T, E, Op, Fut, Res, ResFut, Obs>(
        &self,
        source_key: &str,
        shutdown: &watch::Receiver<bool>,
        mut op: Op,
        mut resolve: Res,
        observer: &mut Obs,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Res: FnMut() -> ResFut,
        ResFut: Future<Output = Result<Option<T>, E>>,
        Obs: FnMut(AttemptInfo<'_, T, E>),
    {
        let mut failures: u32 = 0;
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Err(RetryError::Cancelled);
            }

            self.limiter.admit(source_key).await;
            attempt += 1;
            let started = Instant::now();
            let result = op().await;
            let duration = started.elapsed();

            let err = match result {
                Ok(value) => {
                    observer(AttemptInfo {
                        attempt,
                        duration,
                        result: Ok(&value),
                    });
                    return Ok(value);
                }
                Err(err) => err,
            };

            let mut class = err.class();

            if class == ErrorClass::Ambiguous {
                // Unknown server-side outcome: ask the resolver before
                // deciding retry vs accept.
                if let Ok(Some(value)) = resolve().await {
                    debug!(source_key, attempt, "ambiguous attempt resolved as success");
                    observer(AttemptInfo {
                        attempt,
                        duration,
                        result: Ok(&value),
                    });
                    return Ok(value);
                }
                class = ErrorClass::Transient;
            }

            observer(AttemptInfo {
                attempt,
                duration,
                result: Err(&err),
            });

            match class {
                ErrorClass::Permanent => {
                    failures += 1;
                    return Err(RetryError::Failed {
                        source: err,
                        attempts: failures,
                    });
                }
                ErrorClass::RateLimited => {
                    let cooldown = err
                        .retry_after()
                        .unwrap_or_else(|| self.config.rate_limit_cooldown());
                    debug!(source_key, ?cooldown, "rate limited, cooling down");
                    sleep_interruptible(cooldown, shutdown).await;
                }
                ErrorClass::Transient | ErrorClass::Ambiguous => {
                    failures += 1;
                    if failures >= self.config.max_retries {
                        return Err(RetryError::Failed {
                            source: err,
                            attempts: failures,
                        });
                    }
                    let delay = self.backoff_with_jitter(failures);
                    debug!(source_key, failures, ?delay, "transient failure, backing off");
                    sleep_interruptible(delay, shutdown).await;
                }
            }
        }
    }

    fn backoff_with_jitter(&self, failures: u32) -> Duration {
        let base = self.config.backoff_for_failures(failures);
        let jitter_ceiling = (base.as_millis() as u64) / 4;
        if jitter_ceiling == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        base + Duration::from_millis(jitter)
    }
}

/// Sleep that wakes early if shutdown is signalled.
async fn sleep_interruptible(duration: Duration, shutdown: &watch::Receiver<bool>) {
    let mut rx = shutdown.clone();
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => break,
            changed = rx.changed() => {
                if changed.is_err() || *rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        RateLimited,
        Permanent,
        Ambiguous,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            match self {
                TestError::Transient => ErrorClass::Transient,
                TestError::RateLimited => ErrorClass::RateLimited,
                TestError::Permanent => ErrorClass::Permanent,
                TestError::Ambiguous => ErrorClass::Ambiguous,
            }
        }
    }

    fn executor() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::testing(),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
        )
    }

    fn live_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    async fn no_resolution() -> Result<Option<String>, TestError> {
        Ok(None)
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let executor = executor();
        let (_tx, rx) = live_shutdown();
        let mut observed = Vec::new();

        let result = executor
            .execute(
                "test",
                &rx,
                || async { Ok::<_, TestError>("evt_abc".to_string()) },
                no_resolution,
                &mut |info: AttemptInfo<'_, String, TestError>| {
                    observed.push((info.attempt, info.result.is_ok()));
                },
            )
            .await
            .unwrap();

        assert_eq!(result, "evt_abc");
        assert_eq!(observed, vec![(1, true)]);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_budget() {
        let executor = executor();
        let (_tx, rx) = live_shutdown();
        let calls = AtomicU32::new(0);
        let mut observed = Vec::new();

        let result: Result<String, _> = executor
            .execute(
                "test",
                &rx,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::Transient) }
                },
                no_resolution,
                &mut |info| observed.push((info.attempt, info.result.is_ok())),
            )
            .await;

        match result {
            Err(RetryError::Failed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observed, vec![(1, false), (2, false), (3, false)]);
    }

    #[tokio::test]
    async fn transient_then_success() {
        let executor = executor();
        let (_tx, rx) = live_shutdown();
        let calls = AtomicU32::new(0);
        let mut observed = Vec::new();

        let result = executor
            .execute(
                "test",
                &rx,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(TestError::Transient)
                        } else {
                            Ok("evt_abc".to_string())
                        }
                    }
                },
                no_resolution,
                &mut |info| observed.push(info.result.is_ok()),
            )
            .await
            .unwrap();

        assert_eq!(result, "evt_abc");
        assert_eq!(observed, vec![false, true]);
    }

    #[tokio::test]
    async fn permanent_fails_without_retry() {
        let executor = executor();
        let (_tx, rx) = live_shutdown();
        let calls = AtomicU32::new(0);

        let result: Result<String, _> = executor
            .execute(
                "test",
                &rx,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::Permanent) }
                },
                no_resolution,
                &mut |_| {},
            )
            .await;

        assert!(matches!(result, Err(RetryError::Failed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_does_not_consume_budget() {
        let executor = executor();
        let (_tx, rx) = live_shutdown();
        let calls = AtomicU32::new(0);
        let mut attempts_seen = 0u32;

        // Two 429s, then transient failures until the budget runs out: the
        // 429s must not count, so five calls happen in total.
        let result: Result<String, _> = executor
            .execute(
                "test",
                &rx,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(TestError::RateLimited)
                        } else {
                            Err(TestError::Transient)
                        }
                    }
                },
                no_resolution,
                &mut |_| attempts_seen += 1,
            )
            .await;

        match result {
            Err(RetryError::Failed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(attempts_seen, 5);
    }

    #[tokio::test]
    async fn ambiguous_resolved_as_success() {
        let executor = executor();
        let (_tx, rx) = live_shutdown();
        let mut observed = Vec::new();

        let result = executor
            .execute(
                "test",
                &rx,
                || async { Err(TestError::Ambiguous) },
                || async { Ok(Some("evt_found".to_string())) },
                &mut |info: AttemptInfo<'_, String, TestError>| {
                    observed.push(info.result.is_ok());
                },
            )
            .await
            .unwrap();

        assert_eq!(result, "evt_found");
        // The ambiguous attempt is audited as a success, not a failure.
        assert_eq!(observed, vec![true]);
    }

    #[tokio::test]
    async fn ambiguous_unresolved_consumes_budget() {
        let executor = executor();
        let (_tx, rx) = live_shutdown();
        let calls = AtomicU32::new(0);

        let result: Result<String, _> = executor
            .execute(
                "test",
                &rx,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::Ambiguous) }
                },
                no_resolution,
                &mut |_| {},
            )
            .await;

        match result {
            Err(RetryError::Failed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let executor = executor();
        let (tx, rx) = live_shutdown();
        tx.send(true).unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<String, _> = executor
            .execute(
                "test",
                &rx,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok("evt".to_string()) }
                },
                no_resolution,
                &mut |_| {},
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_between_attempts() {
        // Slow backoff so the shutdown lands during the sleep.
        let config = RetryConfig {
            max_retries: 5,
            base_backoff_ms: 5_000,
            max_backoff_ms: 5_000,
            rate_limit_cooldown_ms: 5_000,
        };
        let executor = RetryExecutor::new(
            config,
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
        );
        let (tx, rx) = live_shutdown();
        let calls = Arc::new(AtomicU32::new(0));

        let handle = {
            let rx = rx.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                let result: Result<String, _> = executor
                    .execute(
                        "test",
                        &rx,
                        || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async { Err(TestError::Transient) }
                        },
                        no_resolution,
                        &mut |_| {},
                    )
                    .await;
                result
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
