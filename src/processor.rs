//! Processors: the code a queue runs for each job.
//!
//! A processor is a plain value implementing one async method. State it needs
//! is captured explicitly, either as struct fields or in a closure wrapped by
//! [`processor_fn`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::Queue;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, LogLevel};

/// What a processor returns: a result value or any error.
pub type HandlerResult = anyhow::Result<serde_json::Value>;

/// Concurrency of a processor registered without an explicit value.
pub const DEFAULT_CONCURRENCY: usize = 1;

#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, ctx: JobContext) -> HandlerResult;
}

/// Adapter turning a closure into a [`Processor`]. See [`processor_fn`].
pub struct FnProcessor<F>(F);

/// Wrap an async closure as a processor.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Registration options for a processor.
///
/// Absent values are optional: no name means the queue's default processor,
/// no concurrency means [`DEFAULT_CONCURRENCY`]. Present-but-empty values
/// are rejected instead of being treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorOptions {
    pub name: Option<String>,
    pub concurrency: Option<usize>,
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only handle jobs submitted with this name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new().name(name)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = Some(n);
        self
    }

    /// Worker slots this processor adds to its queue.
    pub fn slots(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::InvalidOptions(
                "processor name must not be empty".to_string(),
            ));
        }
        if self.concurrency == Some(0) {
            return Err(Error::InvalidOptions(
                "processor concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Job context
// ---------------------------------------------------------------------------

/// Handed to a processor for one attempt of one job.
pub struct JobContext {
    job: Job,
    queue: Arc<Queue>,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(job: Job, queue: Arc<Queue>, cancel: CancellationToken) -> Self {
        Self { job, queue, cancel }
    }

    /// Snapshot of the job taken when this attempt started.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// 1-based number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    /// Store a progress value on the job and emit a `progress` event.
    ///
    /// Fails with [`Error::Cancelled`] once this attempt has been abandoned.
    pub fn progress(&self, progress: impl Into<serde_json::Value>) -> Result<()> {
        self.queue
            .report_progress(self.job.id, self.job.attempts, progress.into())
    }

    /// Append a line to the job's log.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.queue
            .append_log(self.job.id, self.job.attempts, level, message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the job is cancelled or its attempt times out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
