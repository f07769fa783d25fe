//! Core data model.
//!
//! A job is one unit of work submitted to a named queue. It carries an opaque
//! payload, a priority, a retry policy, and its lifecycle state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,

    /// Name of the queue that owns this job.
    pub queue: String,

    /// Processor name. `None` routes to the queue's default processor.
    pub name: Option<String>,

    /// Arbitrary data for the processor. The engine doesn't interpret it.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub state: State,

    /// Higher = dispatched first.
    pub priority: i32,

    /// Insertion order within the queue. Breaks priority ties.
    pub seq: u64,

    /// Number of attempts started so far.
    pub attempts: u32,

    pub max_attempts: u32,

    pub backoff: Backoff,

    /// Deadline for a single attempt. `None` means no deadline.
    pub timeout: Option<Duration>,

    /// Number of failed attempts that were sent back for a retry.
    pub retries: u32,

    /// Last value reported through the job context.
    pub progress: serde_json::Value,

    /// Value returned by the processor on success.
    pub result: Option<serde_json::Value>,

    /// Most recent failure, if any attempt failed.
    pub failure: Option<Failure>,

    /// Job-scoped log lines written by the processor.
    pub logs: Vec<LogEntry>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delay_until: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The error a caller awaiting this job should see, if it failed.
    pub fn error(&self) -> Option<Error> {
        if self.state != State::Failed {
            return None;
        }
        let failure = self.failure.as_ref()?;
        let err = match failure.reason {
            FailureReason::Cancelled => Error::Cancelled,
            FailureReason::MissingProcessor => {
                Error::MissingProcessor(self.name.clone().unwrap_or_default())
            }
            _ if self.max_attempts > 1 => Error::MaxAttemptsExceeded {
                attempts: self.attempts,
                last_error: failure.message.clone(),
            },
            FailureReason::Stalled => Error::Timeout {
                attempt: failure.attempt,
            },
            FailureReason::Error | FailureReason::Panicked => Error::Handler {
                attempt: failure.attempt,
                message: failure.message.clone(),
            },
        };
        Some(err)
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Ready for dispatch, waiting for a free slot.
    Waiting,
    /// Bound to a worker slot, processor running.
    Active,
    /// Done successfully. Terminal.
    Completed,
    /// Exhausted attempts, cancelled, or unroutable. Terminal.
    Failed,
    /// Parked until its delay elapses, then waiting again.
    Delayed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Waiting, Active)
                | (Waiting, Failed)     // cancelled or unroutable before running
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed)     // retry with backoff
                | (Active, Waiting)     // interrupted by a restart, re-queue
                | (Delayed, Waiting)
                | (Delayed, Failed) // cancelled while parked
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Waiting => "waiting",
            State::Active => "active",
            State::Completed => "completed",
            State::Failed => "failed",
            State::Delayed => "delayed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay applied before a failed job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `delay * 2^(attempt - 1)`.
    Exponential { delay: Duration },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn exponential(delay: Duration) -> Self {
        Backoff::Exponential { delay }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { delay } => 2u32
                .checked_pow(attempt.saturating_sub(1))
                .and_then(|factor| delay.checked_mul(factor))
                .unwrap_or(Duration::MAX),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed {
            delay: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The processor returned an error.
    Error,
    /// The processor panicked.
    Panicked,
    /// The attempt ran past its deadline.
    Stalled,
    /// The job was cancelled. Never retried.
    Cancelled,
    /// No processor is registered for the job's name. Never retried.
    MissingProcessor,
}

impl FailureReason {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureReason::Error | FailureReason::Panicked | FailureReason::Stalled
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::Error => "error",
            FailureReason::Panicked => "panicked",
            FailureReason::Stalled => "stalled",
            FailureReason::Cancelled => "cancelled",
            FailureReason::MissingProcessor => "missing_processor",
        };
        write!(f, "{s}")
    }
}

/// A failed attempt, stored on the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// How many finished jobs a queue keeps around.
///
/// Both bounds apply when set. The default keeps everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Keep at most this many finished jobs (newest win).
    pub max_count: Option<usize>,
    /// Evict finished jobs older than this.
    pub max_age: Option<Duration>,
}

impl Retention {
    pub fn keep_all() -> Self {
        Self::default()
    }

    pub fn remove_all() -> Self {
        Self::count(0)
    }

    pub fn count(n: usize) -> Self {
        Self {
            max_count: Some(n),
            max_age: None,
        }
    }

    pub fn age(age: Duration) -> Self {
        Self {
            max_count: None,
            max_age: Some(age),
        }
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

/// Number of jobs in each state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Log Entry
// ---------------------------------------------------------------------------

/// A log line scoped to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Per-job submission options. Unset fields fall back to the queue's config.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub(crate) name: Option<String>,
    pub(crate) priority: Option<i32>,
    pub(crate) delay: Option<Duration>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) backoff: Option<Backoff>,
    pub(crate) timeout: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the job to the processor registered under `name`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
