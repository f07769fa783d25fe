//! Worker slots and attempt execution.
//!
//! A slot runs exactly one processor invocation at a time. The processor
//! runs in its own task so that a panic, a timeout or a cancellation ends
//! the attempt without taking the slot or the dispatcher down with it.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};

use super::queue::Queue;
use crate::model::{FailureReason, Job, State};
use crate::processor::{JobContext, Processor};
use crate::telemetry::job::{record_outcome, record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// One unit of execution concurrency within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerSlot(usize);

impl WorkerSlot {
    pub(super) fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// Everything a slot needs to run one attempt.
pub(super) struct Launch {
    pub(super) job: Job,
    pub(super) processor: Arc<dyn Processor>,
    pub(super) slot: WorkerSlot,
    pub(super) cancel: CancellationToken,
}

/// How an attempt ended.
#[derive(Debug)]
pub(super) enum AttemptOutcome {
    Completed(serde_json::Value),
    Failed {
        reason: FailureReason,
        message: String,
    },
}

impl AttemptOutcome {
    fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        AttemptOutcome::Failed {
            reason,
            message: message.into(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Completed(_) => "completed",
            AttemptOutcome::Failed { reason, .. } => match reason {
                FailureReason::Error => "error",
                FailureReason::Panicked => "panicked",
                FailureReason::Stalled => "stalled",
                FailureReason::Cancelled => "cancelled",
                FailureReason::MissingProcessor => "missing_processor",
            },
        }
    }
}

/// Run one attempt on its slot and hand the outcome back to the queue.
pub(super) async fn run(queue: Arc<Queue>, launch: Launch) {
    let Launch {
        job,
        processor,
        slot,
        cancel,
    } = launch;
    let id = job.id;
    let span = start_job_span(&job);

    async {
        record_state_transition(&span, State::Waiting, State::Active);
        let started = Instant::now();

        let outcome = execute(&queue, job, processor, cancel).await;

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let label = outcome.label();
        record_outcome(&span, label);
        metrics::job_duration_ms().record(
            duration_ms,
            &[
                KeyValue::new("queue", queue.name().to_string()),
                KeyValue::new("outcome", label),
            ],
        );
        debug!(slot = slot.index(), duration_ms, outcome = label, "attempt finished");

        queue.finish(id, outcome);
    }
    .instrument(span.clone())
    .await
}

async fn execute(
    queue: &Arc<Queue>,
    job: Job,
    processor: Arc<dyn Processor>,
    cancel: CancellationToken,
) -> AttemptOutcome {
    let timeout = job.timeout;
    let attempt = job.attempts;
    let ctx = JobContext::new(job, Arc::clone(queue), cancel.clone());

    let mut handle = tokio::spawn(async move { processor.process(ctx).await }.in_current_span());
    let deadline = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let timed_out = tokio::select! {
        joined = &mut handle => return match joined {
            Ok(Ok(value)) => AttemptOutcome::Completed(value),
            Ok(Err(err)) => AttemptOutcome::failed(FailureReason::Error, format!("{err:#}")),
            Err(err) if err.is_panic() => {
                AttemptOutcome::failed(FailureReason::Panicked, panic_message(err.into_panic()))
            }
            Err(err) => AttemptOutcome::failed(FailureReason::Cancelled, err.to_string()),
        },
        _ = cancel.cancelled() => false,
        _ = deadline => true,
    };

    cancel.cancel();
    handle.abort();
    // The slot is released by `finish`, so the invocation must be over by then.
    let _ = handle.await;

    if timed_out {
        AttemptOutcome::failed(
            FailureReason::Stalled,
            format!(
                "attempt {attempt} exceeded its {:?} deadline",
                timeout.unwrap_or(Duration::ZERO)
            ),
        )
    } else {
        AttemptOutcome::failed(FailureReason::Cancelled, "job was cancelled")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("processor panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("processor panicked: {s}")
    } else {
        "processor panicked".to_string()
    }
}
