//! # jobq
//!
//! In-process job queue engine: named queues, priority-ordered dispatch onto
//! bounded worker slots, retries with backoff, timeouts and cancellation,
//! lifecycle events delivered to listeners, and OpenTelemetry observability.

pub mod binding;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod processor;
pub mod storage;
pub mod telemetry;
