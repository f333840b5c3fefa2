//! Per-source sliding-window rate limiting.
//!
//! Each source key gets its own window of recent call instants. Admission
//! beyond the configured `(max_calls, window)` suspends the caller until the
//! oldest call in the window expires -- rate limit is a scheduling
//! constraint here, never an error. The external service's own quota is the
//! hard backstop, so in-memory state (reset on restart) is acceptable.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Sliding-window rate limiter keyed by source.
///
/// Safe for concurrent callers sharing a key: the window map sits behind a
/// plain mutex that is never held across an await point, and waiters
/// re-check the window after sleeping, so racing callers cannot overfill a
/// window.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a call for `source_key`, suspending until a slot is free.
    pub async fn admit(&self, source_key: &str) {
        loop {
            match self.try_reserve(source_key) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Non-blocking admission. Returns false if the window is full.
    pub fn try_admit(&self, source_key: &str) -> bool {
        self.try_reserve(source_key).is_ok()
    }

    /// Reserve a slot now, or report how long until the oldest call expires.
    fn try_reserve(&self, source_key: &str) -> Result<(), Duration> {
        let limit = self.config.for_source(source_key);
        let window = limit.window();
        let now = Instant::now();

        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let calls = windows.entry(source_key.to_string()).or_default();

        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }

        if (calls.len() as u32) < limit.max_calls {
            calls.push_back(now);
            Ok(())
        } else {
            // Unwraps are safe: the window is non-empty when full.
            let oldest = *calls.front().expect("full window has a front");
            Err(window.saturating_sub(now.duration_since(oldest)))
        }
    }
}
