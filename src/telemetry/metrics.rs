//! Metric instrument factories for jobq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: jobs submitted.
/// Labels: `queue`, `result` ("ok" | "closed" | "invalid" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job state transitions.
/// Labels: `queue`, `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Histogram: attempt duration in milliseconds.
/// Labels: `queue`, `outcome`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.job.duration_ms")
        .with_description("Job attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: listener invocations that returned an error or panicked.
/// Labels: `queue`, `kind`.
pub fn listener_failures() -> Counter<u64> {
    meter()
        .u64_counter("jobq.listener.failures")
        .with_description("Number of failed listener invocations")
        .build()
}

/// Counter: finished jobs evicted by retention.
/// Labels: `queue`.
pub fn jobs_evicted() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.evicted")
        .with_description("Number of finished jobs evicted by retention")
        .build()
}
