//! Job execution span helpers.
//!
//! One span per attempt, with state transitions recorded as events on it.

use tracing::Span;

use crate::model::{Job, State};

/// Start a span for one attempt of a job.
///
/// The `job.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_job_span(job: &Job) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.queue" = %job.queue,
        "job.id" = %job.id.0,
        "job.name" = job.name.as_deref().unwrap_or("default"),
        "job.attempt" = job.attempts,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}

/// Record how the attempt ended.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}
