use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::types::ModelSelection;

pub const DEFAULT_TICK_MILLIS: u64 = 50; // one tick at 20 TPS
pub const DEFAULT_RETRY_WINDOW_MS: u64 = 5_000;
pub const DEFAULT_RETRY_POLL_MS: u64 = 50;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 200;
pub const DEFAULT_MAX_UNOWNED_TICKS: u32 = 100; // 5 s at 20 TPS
pub const DEFAULT_OFFLOOP_WORKERS: usize = 4;
pub const ENV_PREFIX: &str = "REGIONTICK_";

/// Top-level config (regiontick.toml + REGIONTICK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegiontickConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub offloop: OffloopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wall-clock length of one tick, used to convert durations into ticks.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// `auto` asks the host once at bind time.
    #[serde(default)]
    pub threading_model: ModelSelection,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: DEFAULT_TICK_MILLIS,
            threading_model: ModelSelection::Auto,
        }
    }
}

/// Policy for targets that exist but are not yet owned by any context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Wall-clock ceiling for how long a task may wait for its target.
    #[serde(default = "default_retry_window_ms")]
    pub window_ms: u64,
    /// Period of the background poller that re-resolves parked tasks.
    #[serde(default = "default_retry_poll_ms")]
    pub poll_interval_ms: u64,
    /// Resolution attempts before a parked task gives up, whatever the window says.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Tick ceiling for the single-loop dispatcher's next-tick retries.
    #[serde(default = "default_max_unowned_ticks")]
    pub max_unowned_ticks: u32,
    /// Start the poller when the scheduler binds. Disable to poll by hand.
    #[serde(default = "bool_true")]
    pub spawn_poller: bool,
}

impl RetryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RETRY_WINDOW_MS,
            poll_interval_ms: DEFAULT_RETRY_POLL_MS,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            max_unowned_ticks: DEFAULT_MAX_UNOWNED_TICKS,
            spawn_poller: true,
        }
    }
}

/// Worker pool for tasks that run off the tick loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloopConfig {
    #[serde(default = "default_offloop_workers")]
    pub workers: usize,
    #[serde(default = "default_offloop_thread_name")]
    pub thread_name: String,
}

impl Default for OffloopConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_OFFLOOP_WORKERS,
            thread_name: default_offloop_thread_name(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_millis() -> u64 {
    DEFAULT_TICK_MILLIS
}
fn default_retry_window_ms() -> u64 {
    DEFAULT_RETRY_WINDOW_MS
}
fn default_retry_poll_ms() -> u64 {
    DEFAULT_RETRY_POLL_MS
}
fn default_retry_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}
fn default_max_unowned_ticks() -> u32 {
    DEFAULT_MAX_UNOWNED_TICKS
}
fn default_offloop_workers() -> usize {
    DEFAULT_OFFLOOP_WORKERS
}
fn default_offloop_thread_name() -> String {
    "regiontick-offloop".to_string()
}

impl RegiontickConfig {
    /// Load config from a TOML file with REGIONTICK_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `REGIONTICK_RETRY__WINDOW_MS=2000` sets `retry.window_ms`.
    /// A missing file is not an error; defaults fill every gap.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RegiontickConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        let config: RegiontickConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the scheduler spin or divide by zero.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_millis == 0 {
            return Err(invalid("scheduler.tick_millis", "must be at least 1"));
        }
        if self.retry.window_ms == 0 {
            return Err(invalid("retry.window_ms", "retry window must be finite and non-zero"));
        }
        if self.retry.poll_interval_ms == 0 {
            return Err(invalid("retry.poll_interval_ms", "must be at least 1"));
        }
        if self.offloop.workers == 0 {
            return Err(invalid("offloop.workers", "pool needs at least one worker"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> CoreError {
    CoreError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}
