//! Typed configuration.
//!
//! Engine and queue settings are plain structs built in code. The only
//! values read from the environment are ambient tunables (log level,
//! telemetry endpoint, sweep cadence), loaded once at startup and
//! failing fast when a value doesn't parse.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{Backoff, Retention};

/// Defaults applied to every job of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Attempts a job gets when submitted without `max_attempts`.
    pub default_max_attempts: u32,
    pub default_backoff: Backoff,
    /// Per-attempt deadline for jobs submitted without one.
    pub default_timeout: Option<Duration>,
    /// Retention for jobs that completed.
    pub remove_on_complete: Retention,
    /// Retention for jobs that failed permanently.
    pub remove_on_fail: Retention,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 1,
            default_backoff: Backoff::default(),
            default_timeout: None,
            remove_on_complete: Retention::keep_all(),
            remove_on_fail: Retention::keep_all(),
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How often the dispatcher promotes due delayed jobs and applies
    /// age-based retention.
    pub sweep_interval: Duration,
    /// How long shutdown waits for active jobs before interrupting them.
    pub shutdown_grace: Duration,
    /// Config for queues declared without one.
    pub queue_defaults: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
            queue_defaults: QueueConfig::default(),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables. Every variable is optional.
    pub fn from_env() -> Result<Self> {
        let mut engine = EngineConfig::default();
        if let Some(ms) = parsed_var::<u64>("JOBQ_SWEEP_INTERVAL_MS")? {
            if ms == 0 {
                return Err(Error::Config(
                    "JOBQ_SWEEP_INTERVAL_MS must be greater than 0".to_string(),
                ));
            }
            engine.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed_var::<u64>("JOBQ_SHUTDOWN_GRACE_MS")? {
            engine.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(n) = parsed_var::<u32>("JOBQ_DEFAULT_MAX_ATTEMPTS")? {
            if n == 0 {
                return Err(Error::Config(
                    "JOBQ_DEFAULT_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            engine.queue_defaults.default_max_attempts = n;
        }

        Ok(Self {
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            engine,
        })
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
