use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

// ── Scheduler config ────────────────────────────────────────────────

/// Scheduler configuration, typically parsed from the `[scheduler]` section
/// of a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool size. 0 = available parallelism.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Queue capacity; submissions beyond it are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Default per-attempt timeout.
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,
    /// Upper bound applied to every per-task timeout.
    #[serde(default = "default_max_task_execution_time_ms")]
    pub max_task_execution_time_ms: u64,
    /// When false, failed attempts are never retried.
    #[serde(default = "default_enable_retry")]
    pub enable_retry: bool,
    /// Default retry budget (attempts beyond the first).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before the first retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Factor applied to the delay for each further retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap on the exponential backoff delay.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Idle time after which a worker is reported as expired (advisory).
    #[serde(default = "default_worker_idle_timeout_ms")]
    pub worker_idle_timeout_ms: u64,
    /// Interval between pool health log lines.
    #[serde(default = "default_worker_heartbeat_interval_ms")]
    pub worker_heartbeat_interval_ms: u64,
    /// Dispatch tick cadence. Ticks also fire on submission and slot release.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// How long `shutdown` waits for busy workers before force-cancelling.
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,
    /// Upper bound on how long `execute_task` blocks the caller.
    #[serde(default = "default_execute_wait_timeout_ms")]
    pub execute_wait_timeout_ms: u64,
    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_workers() -> usize { 4 }
fn default_max_queue_size() -> usize { 1000 }
fn default_worker_timeout_ms() -> u64 { 30_000 }
fn default_max_task_execution_time_ms() -> u64 { 300_000 }
fn default_enable_retry() -> bool { true }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_retry_delay_ms() -> u64 { 30_000 }
fn default_worker_idle_timeout_ms() -> u64 { 60_000 }
fn default_worker_heartbeat_interval_ms() -> u64 { 10_000 }
fn default_dispatch_interval_ms() -> u64 { 50 }
fn default_shutdown_grace_period_ms() -> u64 { 5_000 }
fn default_execute_wait_timeout_ms() -> u64 { 600_000 }
fn default_event_buffer() -> usize { 1024 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_queue_size: default_max_queue_size(),
            worker_timeout_ms: default_worker_timeout_ms(),
            max_task_execution_time_ms: default_max_task_execution_time_ms(),
            enable_retry: default_enable_retry(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            worker_idle_timeout_ms: default_worker_idle_timeout_ms(),
            worker_heartbeat_interval_ms: default_worker_heartbeat_interval_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            execute_wait_timeout_ms: default_execute_wait_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply `QUALIS_*` env overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedulerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Resolve worker count (0 means use available parallelism).
    pub fn resolved_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_workers
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn max_task_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_task_execution_time_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }

    pub fn worker_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.worker_heartbeat_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn execute_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_wait_timeout_ms)
    }

    /// Pool-wide default retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.enable_retry,
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply `QUALIS_*` environment variable overrides.
    ///
    /// - `QUALIS_MAX_WORKERS` → `max_workers`
    /// - `QUALIS_MAX_QUEUE_SIZE` → `max_queue_size`
    /// - `QUALIS_WORKER_TIMEOUT_MS` → `worker_timeout_ms`
    /// - `QUALIS_ENABLE_RETRY` → `enable_retry`
    /// - `QUALIS_MAX_RETRIES` → `max_retries`
    /// - `QUALIS_RETRY_DELAY_MS` → `retry_delay_ms`
    /// - `QUALIS_BACKOFF_MULTIPLIER` → `backoff_multiplier`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(&lookup, "QUALIS_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Some(v) = parsed(&lookup, "QUALIS_MAX_QUEUE_SIZE") {
            self.max_queue_size = v;
        }
        if let Some(v) = parsed(&lookup, "QUALIS_WORKER_TIMEOUT_MS") {
            self.worker_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "QUALIS_ENABLE_RETRY") {
            self.enable_retry = v;
        }
        if let Some(v) = parsed(&lookup, "QUALIS_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "QUALIS_RETRY_DELAY_MS") {
            self.retry_delay_ms = v;
        }
        if let Some(v) = parsed(&lookup, "QUALIS_BACKOFF_MULTIPLIER") {
            self.backoff_multiplier = v;
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_queue_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_queue_size must be greater than 0".into(),
            ));
        }
        if self.worker_timeout_ms == 0 || self.max_task_execution_time_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "task timeouts must be greater than 0".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.dispatch_interval_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "dispatch_interval_ms must be greater than 0".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(SchedulerError::InvalidConfig(
                "event_buffer must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ── Partial update ──────────────────────────────────────────────────

/// Partial configuration update for [`Scheduler::update_config`](crate::Scheduler::update_config).
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub max_workers: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub worker_timeout_ms: Option<u64>,
    pub max_task_execution_time_ms: Option<u64>,
    pub enable_retry: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_retry_delay_ms: Option<u64>,
    pub worker_idle_timeout_ms: Option<u64>,
    pub worker_heartbeat_interval_ms: Option<u64>,
    pub dispatch_interval_ms: Option<u64>,
    pub shutdown_grace_period_ms: Option<u64>,
    pub execute_wait_timeout_ms: Option<u64>,
}

impl ConfigUpdate {
    pub fn apply_to(&self, config: &mut SchedulerConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { config.$field = v; })*
            };
        }
        set!(
            max_workers,
            max_queue_size,
            worker_timeout_ms,
            max_task_execution_time_ms,
            enable_retry,
            max_retries,
            retry_delay_ms,
            backoff_multiplier,
            max_retry_delay_ms,
            worker_idle_timeout_ms,
            worker_heartbeat_interval_ms,
            dispatch_interval_ms,
            shutdown_grace_period_ms,
            execute_wait_timeout_ms,
        );
    }
}

// ── Retry policy ────────────────────────────────────────────────────

/// Retry budget and exponential backoff for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retry_count` retries.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        self.enabled && retry_count < self.max_retries
    }

    /// Delay before retry number `retry_count` (1-based):
    /// `base_delay * multiplier^(retry_count - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
