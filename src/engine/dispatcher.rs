//! Dispatch: matching ready jobs to free worker slots.
//!
//! Each queue keeps a max-heap of waiting jobs ordered by priority, then by
//! insertion, and a min-heap of delayed jobs ordered by due time. A dispatch
//! pass promotes due delayed jobs and then activates ready jobs while slots
//! are free. Passes run on submission, on slot release, on processor
//! registration, and on every sweep of the [`Dispatcher`] loop.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::queue::{Lease, Queue, QueueState};
use super::worker::{self, Launch};
use crate::event::EventPayload;
use crate::model::{Failure, FailureReason, Job, JobId, State};

/// Position of a waiting job in the ready view.
#[derive(Debug, Clone, Copy)]
pub(super) struct ReadyEntry {
    pub(super) priority: i32,
    pub(super) seq: u64,
    pub(super) id: JobId,
}

impl ReadyEntry {
    pub(super) fn of(job: &Job) -> Self {
        Self {
            priority: job.priority,
            seq: job.seq,
            id: job.id,
        }
    }
}

impl Ord for ReadyEntry {
    /// Greater = dispatched first: higher priority, then earlier insertion.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

/// Position of a delayed job in the delay view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct DelayedEntry {
    pub(super) until: DateTime<Utc>,
    pub(super) seq: u64,
    pub(super) id: JobId,
}

/// `now + delay`, saturating at the maximum representable time.
pub(super) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - age`, saturating at the minimum representable time.
pub(super) fn deadline_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Queue {
    /// One dispatch pass. Handlers are spawned after the state lock is released.
    pub(crate) fn dispatch(self: &Arc<Self>) {
        let mut launches = Vec::new();
        let mut settled = false;
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            let now = Utc::now();
            self.promote_due(st, now);
            if !st.running || st.closed {
                return;
            }

            while !st.free_slots.is_empty() {
                let Some(entry) = st.ready.pop() else {
                    break;
                };
                let Some(name) = st
                    .jobs
                    .get(&entry.id)
                    .filter(|job| job.state == State::Waiting)
                    .map(|job| job.name.clone())
                else {
                    // Stale entry: the job was cancelled or evicted.
                    continue;
                };
                let Some(processor) = st.processors.get(&name).cloned() else {
                    self.reject_unroutable(st, entry.id, name);
                    settled = true;
                    continue;
                };
                let Some(slot) = st.free_slots.pop() else {
                    st.ready.push(entry);
                    break;
                };
                let Some(job) = st.jobs.get_mut(&entry.id) else {
                    st.free_slots.push(slot);
                    continue;
                };
                if let Err(e) = self.transition(job, State::Active) {
                    error!(queue = %self.name(), job_id = %entry.id, error = %e, "cannot activate job");
                    st.free_slots.push(slot);
                    continue;
                }
                job.attempts += 1;
                job.processed_at = Some(now);
                job.delay_until = None;
                self.persist("dequeue", job.id, self.store.dequeue(job));

                let cancel = CancellationToken::new();
                st.active.insert(
                    job.id,
                    Lease {
                        slot,
                        cancel: cancel.clone(),
                        interrupted: false,
                    },
                );
                self.events.emit(
                    self.name(),
                    EventPayload::Active {
                        job_id: job.id,
                        attempt: job.attempts,
                    },
                );
                debug!(
                    queue = %self.name(),
                    job_id = %job.id,
                    slot = slot.index(),
                    attempt = job.attempts,
                    "job dispatched"
                );
                launches.push(Launch {
                    job: job.clone(),
                    processor,
                    slot,
                    cancel,
                });
            }

            if settled {
                self.check_drained(st);
            }
        }

        if settled {
            self.notify_settled();
        }
        for launch in launches {
            tokio::spawn(worker::run(Arc::clone(self), launch));
        }
    }

    /// Move delayed jobs whose delay has elapsed into the ready view.
    fn promote_due(&self, st: &mut QueueState, now: DateTime<Utc>) {
        while let Some(Reverse(entry)) = st.delayed.peek().copied() {
            if entry.until > now {
                break;
            }
            st.delayed.pop();

            let Some(job) = st.jobs.get_mut(&entry.id) else {
                continue;
            };
            if job.state != State::Delayed {
                continue;
            }
            if let Err(e) = self.transition(job, State::Waiting) {
                error!(queue = %self.name(), job_id = %entry.id, error = %e, "cannot promote job");
                continue;
            }
            job.delay_until = None;
            self.persist("enqueue", job.id, self.store.enqueue(job));
            st.ready.push(ReadyEntry::of(job));
            st.drained = false;
            self.events
                .emit(self.name(), EventPayload::Waiting { job_id: entry.id });
            debug!(queue = %self.name(), job_id = %entry.id, "delayed job promoted");
        }
    }

    /// A job whose name has no processor fails without retry.
    fn reject_unroutable(&self, st: &mut QueueState, id: JobId, name: Option<String>) {
        let name = name.unwrap_or_default();
        if let Some(job) = st.jobs.get_mut(&id) {
            job.failure = Some(Failure {
                reason: FailureReason::MissingProcessor,
                message: format!("no processor registered for job name {name:?}"),
                attempt: job.attempts,
                at: Utc::now(),
            });
        }
        if let Err(e) = self.bury(st, id) {
            error!(queue = %self.name(), job_id = %id, error = %e, "cannot fail unroutable job");
        }
    }

    /// Periodic maintenance: age-based retention, then a dispatch pass.
    fn sweep(self: &Arc<Self>) {
        let evicted = self.evict_expired();
        if evicted > 0 {
            self.notify_settled();
        }
        self.dispatch();
    }
}

/// The per-process sweep loop. Dispatch decisions themselves are made by
/// each queue under its own lock; this loop only makes sure time-based work
/// (delays, age-based retention) is picked up.
pub(crate) struct Dispatcher {
    queues: Arc<RwLock<HashMap<String, Arc<Queue>>>>,
    interval: Duration,
}

impl Dispatcher {
    pub(crate) fn new(queues: Arc<RwLock<HashMap<String, Arc<Queue>>>>, interval: Duration) -> Self {
        Self { queues, interval }
    }

    /// Run until `cancel` fires.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            sweep_interval_ms = self.interval.as_millis() as u64,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    fn sweep(&self) {
        let queues: Vec<Arc<Queue>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for queue in queues {
            queue.sweep();
        }
    }
}
