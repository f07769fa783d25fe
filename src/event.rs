//! Lifecycle events and the listener bus.
//!
//! Queues emit an event on every observable step of a job's life. Events
//! are buffered in a channel and delivered by a single task, so listeners
//! never run on a worker slot and a slow listener never holds up dispatch.
//! Listeners for the same event run one after another in registration order.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{FailureReason, JobId};
use crate::telemetry::metrics;

/// What a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Waiting,
    Active,
    Progress,
    Completed,
    Failed,
    Stalled,
    /// No waiting and no active jobs left in the queue.
    Drained,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Waiting => "waiting",
            EventKind::Active => "active",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Stalled => "stalled",
            EventKind::Drained => "drained",
        };
        write!(f, "{s}")
    }
}

/// A structured event emitted by a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Monotonic sequence number across the whole bus.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub queue: String,
    pub payload: EventPayload,
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self.payload {
            EventPayload::Waiting { job_id }
            | EventPayload::Active { job_id, .. }
            | EventPayload::Progress { job_id, .. }
            | EventPayload::Completed { job_id, .. }
            | EventPayload::Failed { job_id, .. }
            | EventPayload::Stalled { job_id, .. } => Some(job_id),
            EventPayload::Drained => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Waiting {
        job_id: JobId,
    },
    Active {
        job_id: JobId,
        attempt: u32,
    },
    Progress {
        job_id: JobId,
        progress: serde_json::Value,
    },
    Completed {
        job_id: JobId,
        result: serde_json::Value,
    },
    Failed {
        job_id: JobId,
        reason: FailureReason,
        error: String,
        attempts: u32,
    },
    Stalled {
        job_id: JobId,
        attempt: u32,
    },
    Drained,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Waiting { .. } => EventKind::Waiting,
            EventPayload::Active { .. } => EventKind::Active,
            EventPayload::Progress { .. } => EventKind::Progress,
            EventPayload::Completed { .. } => EventKind::Completed,
            EventPayload::Failed { .. } => EventKind::Failed,
            EventPayload::Stalled { .. } => EventKind::Stalled,
            EventPayload::Drained => EventKind::Drained,
        }
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Receives events for one (queue, kind) subscription.
///
/// Errors and panics are logged by the bus and go no further.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn on_event(&self, event: &QueueEvent) -> anyhow::Result<()>;
}

/// Adapter turning a closure into a [`Listener`]. See [`listener_fn`].
pub struct FnListener<F>(F);

/// Wrap an async closure as a listener. The closure receives its own copy
/// of the event.
pub fn listener_fn<F, Fut>(f: F) -> FnListener<F>
where
    F: Fn(QueueEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnListener(f)
}

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(QueueEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_event(&self, event: &QueueEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Subscription {
    queue: String,
    kind: EventKind,
    listener: Arc<dyn Listener>,
}

/// Fan-out of queue events to registered listeners.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    seq: AtomicU64,
    sender: mpsc::UnboundedSender<QueueEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            subscriptions: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Register a listener. Order of registration is order of invocation.
    pub fn on(&self, queue: impl Into<String>, kind: EventKind, listener: Arc<dyn Listener>) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                queue: queue.into(),
                kind,
                listener,
            });
    }

    /// Number of listeners subscribed to (queue, kind).
    pub fn listener_count(&self, queue: &str, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.queue == queue && s.kind == kind)
            .count()
    }

    /// Queue an event for delivery. Never blocks.
    ///
    /// Events emitted before delivery starts are buffered.
    pub fn emit(&self, queue: &str, payload: EventPayload) {
        let event = QueueEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            queue: queue.to_string(),
            payload,
        };
        // Only fails once the receiver is gone, i.e. after delivery stopped.
        if self.sender.send(event).is_err() {
            debug!(queue, "event dropped, delivery has stopped");
        }
    }

    /// Start the delivery task. Returns `None` if it was already started.
    ///
    /// When `cancel` fires, events already buffered are still delivered
    /// before the task exits.
    pub(crate) fn spawn_delivery(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let bus = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => bus.deliver(event).await,
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            bus.deliver(event).await;
                        }
                        break;
                    }
                }
            }
            rx.close();
            debug!("event delivery stopped");
        }))
    }

    async fn deliver(&self, event: QueueEvent) {
        let kind = event.kind();
        let listeners: Vec<Arc<dyn Listener>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.queue == event.queue && s.kind == kind)
            .map(|s| Arc::clone(&s.listener))
            .collect();

        for listener in listeners {
            let ev = event.clone();
            // Own task per call so a panicking listener is contained.
            let outcome = tokio::spawn(async move { listener.on_event(&ev).await }).await;

            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) if e.is_panic() => "listener panicked".to_string(),
                Err(e) => e.to_string(),
            };
            warn!(queue = %event.queue, kind = %kind, seq = event.seq, %error, "listener failed");
            metrics::listener_failures().add(
                1,
                &[
                    KeyValue::new("queue", event.queue.clone()),
                    KeyValue::new("kind", kind.to_string()),
                ],
            );
        }
    }
}
