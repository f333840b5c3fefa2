//! TOML-based engine configuration.
//!
//! Covers the whole tunable surface of the sync engine:
//! - per-source rate-limit windows
//! - retry/backoff policy
//! - scheduler batch size, concurrency and timeouts
//! - target calendar
//!
//! Configuration is stored at `~/.config/releasecal/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::data_dir;

/// Rate-limit window for a single source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SourceLimit {
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for SourceLimit {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            window_seconds: default_window_seconds(),
        }
    }
}

impl SourceLimit {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Rate-limit configuration: a default window plus per-source overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(flatten)]
    pub default: SourceLimit,
    /// Per-source overrides, keyed by source name (e.g. "google").
    #[serde(default)]
    pub sources: HashMap<String, SourceLimit>,
}

impl RateLimitConfig {
    /// Resolve the limit for a source, falling back to the default window.
    pub fn for_source(&self, source_key: &str) -> SourceLimit {
        self.sources
            .get(source_key)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Retry/backoff policy for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum budget-consuming attempts before a release is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff after the first transient failure.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Ceiling for exponential backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Cool-down when the service rate-limits us and gives no Retry-After.
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retrying after `failures` transient failures (1-based).
    ///
    /// `base * 2^(failures - 1)`, capped at `max_backoff_ms`. Jitter is
    /// added by the retry executor, not here.
    pub fn backoff_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::from_millis(self.base_backoff_ms);
        }
        let ms = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(failures - 1));
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    /// Fast-fail policy for tests.
    pub fn testing() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 5,
            max_backoff_ms: 20,
            rate_limit_cooldown_ms: 5,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum releases selected per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Timeout applied to each remote call.
    #[serde(default = "default_per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,
    /// Wall-clock deadline for a whole cycle. 0 disables the deadline.
    #[serde(default)]
    pub cycle_deadline_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            per_call_timeout_ms: default_per_call_timeout_ms(),
            cycle_deadline_ms: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    pub fn cycle_deadline(&self) -> Option<Duration> {
        if self.cycle_deadline_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.cycle_deadline_ms))
        }
    }
}

/// Target calendar settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            calendar_id: default_calendar_id(),
        }
    }
}

/// Engine configuration.
///
/// Serialized to/from TOML at `~/.config/releasecal/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

// Default functions
fn default_max_calls() -> u32 {
    10
}
fn default_window_seconds() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_rate_limit_cooldown_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    50
}
fn default_concurrency() -> usize {
    4
}
fn default_per_call_timeout_ms() -> u64 {
    30_000
}
fn default_calendar_id() -> String {
    "primary".to_string()
}

impl Config {
    fn config_path() -> Result<PathBuf, ConfigError> {
        let dir = data_dir().map_err(|e| ConfigError::LoadFailed {
            path: PathBuf::from("~/.config/releasecal"),
            message: e.to_string(),
        })?;
        Ok(dir.join("config.toml"))
    }

    /// Load configuration from the default location.
    ///
    /// A missing file yields the default configuration.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}
