//! A named queue: the job table, ready and delayed views, worker slots.
//!
//! Every decision about one queue happens under its single state lock. The
//! lock is never held across an await; processors and listeners run
//! elsewhere.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DelayedEntry, ReadyEntry, deadline_after, deadline_before};
use super::worker::{AttemptOutcome, WorkerSlot};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::event::{EventBus, EventPayload};
use crate::model::*;
use crate::processor::Processor;
use crate::storage::Store;
use crate::telemetry::metrics;

/// Binding of an active job to the slot running it.
pub(super) struct Lease {
    pub(super) slot: WorkerSlot,
    pub(super) cancel: CancellationToken,
    /// Set when shutdown stops the attempt; the job is kept for a restart.
    pub(super) interrupted: bool,
}

#[derive(Default)]
pub(super) struct QueueState {
    pub(super) jobs: HashMap<JobId, Job>,
    pub(super) ready: BinaryHeap<ReadyEntry>,
    pub(super) delayed: BinaryHeap<Reverse<DelayedEntry>>,
    pub(super) active: HashMap<JobId, Lease>,
    pub(super) free_slots: Vec<WorkerSlot>,
    pub(super) slot_count: usize,
    pub(super) processors: HashMap<Option<String>, Arc<dyn Processor>>,
    /// Finished job ids, oldest first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    /// Callers of `wait_finished`, handed the terminal job before eviction.
    waiters: HashMap<JobId, Vec<oneshot::Sender<Job>>>,
    next_seq: u64,
    pub(super) closed: bool,
    pub(super) running: bool,
    pub(super) drained: bool,
}

#[derive(Clone, Copy)]
enum Finished {
    Completed,
    Failed,
}

pub(crate) struct Queue {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    pub(super) store: Arc<dyn Store>,
    pub(super) events: Arc<EventBus>,
    /// Signalled whenever a job settles or a slot is released.
    settled: Notify,
}

impl Queue {
    pub(super) fn new(
        name: String,
        config: QueueConfig,
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(QueueState {
                drained: true,
                ..QueueState::default()
            }),
            store,
            events,
            settled: Notify::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Wake everything waiting on a job to settle or a slot to free up.
    pub(super) fn notify_settled(&self) {
        self.settled.notify_waiters();
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    pub(super) fn submit(
        self: &Arc<Self>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        let result = self.insert(payload, options);
        let label = match &result {
            Ok(_) => "ok",
            Err(Error::QueueClosed(_)) => "closed",
            Err(Error::InvalidOptions(_)) => "invalid",
            Err(_) => "error",
        };
        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("result", label),
            ],
        );

        let id = result?;
        self.dispatch();
        Ok(id)
    }

    fn insert(&self, payload: serde_json::Value, options: JobOptions) -> Result<JobId> {
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(Error::InvalidOptions(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if options.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::InvalidOptions(
                "job name must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let delay = options.delay.filter(|d| !d.is_zero());

        let mut guard = self.lock();
        let st = &mut *guard;
        if st.closed {
            return Err(Error::QueueClosed(self.name.clone()));
        }

        let seq = st.next_seq;
        let delay_until = delay.map(|d| deadline_after(now, d));
        let job = Job {
            id: JobId::new(),
            queue: self.name.clone(),
            name: options.name,
            payload,
            state: if delay_until.is_some() {
                State::Delayed
            } else {
                State::Waiting
            },
            priority: options.priority.unwrap_or(0),
            seq,
            attempts: 0,
            max_attempts,
            backoff: options.backoff.unwrap_or(self.config.default_backoff),
            timeout: options.timeout.or(self.config.default_timeout),
            retries: 0,
            progress: serde_json::Value::Null,
            result: None,
            failure: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
            delay_until,
            processed_at: None,
            finished_at: None,
        };

        // Nothing is visible until the store accepted the job.
        self.store.enqueue(&job)?;
        st.next_seq += 1;

        let id = job.id;
        match delay_until {
            Some(until) => st.delayed.push(Reverse(DelayedEntry { until, seq, id })),
            None => {
                st.ready.push(ReadyEntry::of(&job));
                st.drained = false;
                self.events
                    .emit(&self.name, EventPayload::Waiting { job_id: id });
            }
        }
        info!(
            queue = %self.name,
            job_id = %id,
            priority = job.priority,
            delayed = delay_until.is_some(),
            "job submitted"
        );
        st.jobs.insert(id, job);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Registration and lifecycle
    // -----------------------------------------------------------------------

    /// Add a processor and the worker slots it brings.
    pub(super) fn register(
        self: &Arc<Self>,
        name: Option<String>,
        processor: Arc<dyn Processor>,
        slots: usize,
    ) -> Result<()> {
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.processors.contains_key(&name) {
                return Err(Error::InvalidOptions(format!(
                    "processor {:?} is already registered on queue {}",
                    name.as_deref().unwrap_or("default"),
                    self.name
                )));
            }
            st.processors.insert(name, processor);
            for _ in 0..slots {
                st.free_slots.push(WorkerSlot::new(st.slot_count));
                st.slot_count += 1;
            }
        }
        self.dispatch();
        Ok(())
    }

    pub(super) fn has_processor(&self, name: &Option<String>) -> bool {
        self.lock().processors.contains_key(name)
    }

    /// Allow dispatching. Jobs submitted earlier start now.
    pub(super) fn start(self: &Arc<Self>) {
        self.lock().running = true;
        self.dispatch();
    }

    /// Refuse new submissions and stop dispatching. Active jobs keep running.
    pub(super) fn close(&self) {
        self.lock().closed = true;
        debug!(queue = %self.name, "queue closed");
    }

    /// Stop every active attempt at its next suspension point. The jobs go
    /// back to waiting in the store instead of failing.
    pub(super) fn interrupt_active(&self) {
        let mut st = self.lock();
        for (id, lease) in st.active.iter_mut() {
            lease.interrupted = true;
            lease.cancel.cancel();
            debug!(queue = %self.name, job_id = %id, "interrupting attempt");
        }
    }

    /// Resolves once no job of this queue is active.
    pub(super) async fn wait_idle(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().active.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Rebuild state from jobs loaded out of the store.
    ///
    /// Jobs that were active when the previous process stopped go back to
    /// waiting, unless that attempt was their last: those fail as stalled.
    /// Returns how many jobs were restored.
    pub(super) fn restore(&self, jobs: Vec<Job>) -> usize {
        let now = Utc::now();
        let mut guard = self.lock();
        let st = &mut *guard;
        let total = jobs.len();
        let mut requeued = 0;

        for mut job in jobs {
            st.next_seq = st.next_seq.max(job.seq + 1);
            match job.state {
                State::Active if job.attempts >= job.max_attempts => {
                    let id = job.id;
                    job.failure = Some(Failure {
                        reason: FailureReason::Stalled,
                        message: "final attempt was interrupted by a restart".to_string(),
                        attempt: job.attempts,
                        at: now,
                    });
                    st.jobs.insert(id, job);
                    if let Err(e) = self.bury(st, id) {
                        error!(queue = %self.name, job_id = %id, error = %e, "cannot fail interrupted job");
                    }
                    continue;
                }
                State::Active => {
                    if let Err(e) = self.transition(&mut job, State::Waiting) {
                        error!(queue = %self.name, job_id = %job.id, error = %e, "cannot re-queue job");
                        continue;
                    }
                    self.persist("enqueue", job.id, self.store.enqueue(&job));
                    st.ready.push(ReadyEntry::of(&job));
                    st.drained = false;
                    requeued += 1;
                }
                State::Waiting => {
                    st.ready.push(ReadyEntry::of(&job));
                    st.drained = false;
                }
                State::Delayed => {
                    let until = job.delay_until.unwrap_or(now);
                    st.delayed.push(Reverse(DelayedEntry {
                        until,
                        seq: job.seq,
                        id: job.id,
                    }));
                }
                State::Completed => st.completed.push_back(job.id),
                State::Failed => st.failed.push_back(job.id),
            }
            st.jobs.insert(job.id, job);
        }

        if total > 0 {
            info!(queue = %self.name, total, requeued, "queue restored from store");
        }
        total
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub(super) fn get(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    pub(super) fn contains(&self, id: JobId) -> bool {
        self.lock().jobs.contains_key(&id)
    }

    pub(super) fn counts(&self) -> JobCounts {
        let st = self.lock();
        let mut counts = JobCounts::default();
        for job in st.jobs.values() {
            match job.state {
                State::Waiting => counts.waiting += 1,
                State::Active => counts.active += 1,
                State::Delayed => counts.delayed += 1,
                State::Completed => counts.completed += 1,
                State::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Jobs in `state`, highest priority first, then oldest first.
    pub(super) fn list_by_state(&self, state: State) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (Reverse(job.priority), job.seq));
        jobs
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// The terminal job is handed over directly, so retention evicting it
    /// right away does not lose the result.
    pub(super) async fn wait_finished(&self, id: JobId) -> Result<Job> {
        let rx = {
            let mut st = self.lock();
            let job = st.jobs.get(&id).ok_or(Error::JobNotFound(id))?;
            if job.state.is_terminal() {
                return Ok(job.clone());
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.entry(id).or_default().push(tx);
            rx
        };
        // Senders are only dropped unanswered when shutdown interrupts the job.
        rx.await.map_err(|_| Error::QueueClosed(self.name.clone()))
    }

    // -----------------------------------------------------------------------
    // Processor-facing updates
    // -----------------------------------------------------------------------

    pub(crate) fn report_progress(
        &self,
        id: JobId,
        attempt: u32,
        progress: serde_json::Value,
    ) -> Result<()> {
        let mut st = self.lock();
        let job = current_attempt(&mut st.jobs, id, attempt)?;
        job.progress = progress.clone();
        job.updated_at = Utc::now();
        self.events.emit(
            &self.name,
            EventPayload::Progress {
                job_id: id,
                progress,
            },
        );
        Ok(())
    }

    pub(crate) fn append_log(
        &self,
        id: JobId,
        attempt: u32,
        level: LogLevel,
        message: String,
    ) -> Result<()> {
        let mut st = self.lock();
        let job = current_attempt(&mut st.jobs, id, attempt)?;
        job.logs.push(LogEntry {
            timestamp: Utc::now(),
            attempt,
            level,
            message,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    /// Cancel a job. Active jobs stop at their next suspension point; waiting
    /// and delayed jobs fail right away.
    pub(super) fn cancel(&self, id: JobId) -> Result<()> {
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            let job = st.jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
            match job.state {
                State::Active => {
                    if let Some(lease) = st.active.get(&id) {
                        lease.cancel.cancel();
                    }
                    info!(queue = %self.name, job_id = %id, "cancellation requested");
                    return Ok(());
                }
                State::Waiting | State::Delayed => {
                    job.failure = Some(Failure {
                        reason: FailureReason::Cancelled,
                        message: "job was cancelled".to_string(),
                        attempt: job.attempts,
                        at: Utc::now(),
                    });
                    self.bury(st, id)?;
                    self.check_drained(st);
                }
                state => {
                    return Err(Error::InvalidTransition {
                        from: state,
                        to: State::Failed,
                    });
                }
            }
        }
        self.notify_settled();
        Ok(())
    }

    /// Record the outcome of an attempt, release its slot, dispatch more work.
    pub(super) fn finish(self: &Arc<Self>, id: JobId, outcome: AttemptOutcome) {
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            let interrupted = match st.active.remove(&id) {
                Some(lease) => {
                    st.free_slots.push(lease.slot);
                    lease.interrupted
                }
                None => false,
            };

            let recorded = match outcome {
                AttemptOutcome::Failed {
                    reason: FailureReason::Cancelled,
                    ..
                } if interrupted => self.requeue_interrupted(st, id),
                AttemptOutcome::Completed(value) => self.complete(st, id, value),
                AttemptOutcome::Failed { reason, message } => self.fail(st, id, reason, message),
            };
            if let Err(e) = recorded {
                error!(queue = %self.name, job_id = %id, error = %e, "failed to record attempt outcome");
            }
            self.check_drained(st);
        }
        self.notify_settled();
        self.dispatch();
    }

    fn complete(&self, st: &mut QueueState, id: JobId, value: serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let job = st.jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        self.transition(job, State::Completed)?;
        job.result = Some(value.clone());
        job.finished_at = Some(now);
        self.persist("ack", id, self.store.ack(job));
        info!(queue = %self.name, job_id = %id, attempts = job.attempts, "job completed");

        self.events.emit(
            &self.name,
            EventPayload::Completed {
                job_id: id,
                result: value,
            },
        );
        resolve_waiters(&mut st.waiters, job);
        st.completed.push_back(id);
        self.evict(st, self.config.remove_on_complete, Finished::Completed, now);
        Ok(())
    }

    /// Record a failed attempt, then either schedule a retry or fail the job.
    fn fail(
        &self,
        st: &mut QueueState,
        id: JobId,
        reason: FailureReason,
        message: String,
    ) -> Result<()> {
        let now = Utc::now();
        let job = st.jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        let attempt = job.attempts;
        job.failure = Some(Failure {
            reason,
            message: message.clone(),
            attempt,
            at: now,
        });
        if reason == FailureReason::Stalled {
            warn!(queue = %self.name, job_id = %id, attempt, "job stalled");
            self.events
                .emit(&self.name, EventPayload::Stalled { job_id: id, attempt });
        }

        if !reason.is_retryable() || attempt >= job.max_attempts {
            return self.bury(st, id);
        }

        let delay = job.backoff.delay_for(attempt);
        self.transition(job, State::Delayed)?;
        job.retries += 1;
        warn!(
            queue = %self.name,
            job_id = %id,
            attempt,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            error = %message,
            "attempt failed, retrying"
        );

        if delay.is_zero() {
            self.transition(job, State::Waiting)?;
            job.delay_until = None;
            st.ready.push(ReadyEntry::of(job));
            st.drained = false;
            self.events
                .emit(&self.name, EventPayload::Waiting { job_id: id });
        } else {
            let until = deadline_after(now, delay);
            job.delay_until = Some(until);
            st.delayed.push(Reverse(DelayedEntry {
                until,
                seq: job.seq,
                id,
            }));
        }
        self.persist("enqueue", id, self.store.enqueue(job));
        Ok(())
    }

    /// Put a job whose attempt shutdown cut short back to waiting. The attempt
    /// does not count and nothing is acked, so a restart picks the job up.
    fn requeue_interrupted(&self, st: &mut QueueState, id: JobId) -> Result<()> {
        let job = st.jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        self.transition(job, State::Waiting)?;
        job.attempts = job.attempts.saturating_sub(1);
        self.persist("enqueue", id, self.store.enqueue(job));
        warn!(
            queue = %self.name,
            job_id = %id,
            attempts = job.attempts,
            "attempt interrupted by shutdown, job kept for restart"
        );
        st.ready.push(ReadyEntry::of(job));
        st.waiters.remove(&id);
        Ok(())
    }

    /// Move a job to `failed` for good. Its `failure` must already be set.
    pub(super) fn bury(&self, st: &mut QueueState, id: JobId) -> Result<()> {
        let now = Utc::now();
        let job = st.jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        self.transition(job, State::Failed)?;
        job.finished_at = Some(now);
        job.delay_until = None;
        self.persist("ack", id, self.store.ack(job));

        let (reason, message) = job
            .failure
            .as_ref()
            .map(|f| (f.reason, f.message.clone()))
            .unwrap_or((FailureReason::Error, String::new()));
        warn!(
            queue = %self.name,
            job_id = %id,
            attempts = job.attempts,
            reason = %reason,
            error = %message,
            "job failed"
        );
        self.events.emit(
            &self.name,
            EventPayload::Failed {
                job_id: id,
                reason,
                error: message,
                attempts: job.attempts,
            },
        );
        resolve_waiters(&mut st.waiters, job);
        st.failed.push_back(id);
        self.evict(st, self.config.remove_on_fail, Finished::Failed, now);
        Ok(())
    }

    /// Emit `drained` once per cycle when nothing is waiting or active.
    pub(super) fn check_drained(&self, st: &mut QueueState) {
        if st.drained || !st.active.is_empty() {
            return;
        }
        let waiting = st
            .ready
            .iter()
            .any(|e| st.jobs.get(&e.id).is_some_and(|j| j.state == State::Waiting));
        if !waiting {
            st.drained = true;
            self.events.emit(&self.name, EventPayload::Drained);
        }
    }

    pub(super) fn transition(&self, job: &mut Job, to: State) -> Result<()> {
        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        job.state = to;
        job.updated_at = Utc::now();

        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        debug!(queue = %self.name, job_id = %job.id, %from, %to, "state transition");
        Ok(())
    }

    /// Store failures after submission are logged, not propagated: the
    /// in-memory state stays authoritative for this process.
    pub(super) fn persist(&self, op: &str, id: JobId, result: Result<()>) {
        if let Err(e) = result {
            error!(queue = %self.name, job_id = %id, op, error = %e, "store write failed");
        }
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Evict finished jobs beyond `retention`. Returns how many were evicted.
    pub(super) fn remove_completed(&self, retention: Retention) -> usize {
        let now = Utc::now();
        let mut guard = self.lock();
        let st = &mut *guard;
        self.evict(st, retention, Finished::Completed, now)
            + self.evict(st, retention, Finished::Failed, now)
    }

    /// Apply the configured age bounds. Count bounds are applied on every
    /// terminal transition already.
    pub(super) fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut evicted = 0;
        if self.config.remove_on_complete.max_age.is_some() {
            evicted += self.evict(st, self.config.remove_on_complete, Finished::Completed, now);
        }
        if self.config.remove_on_fail.max_age.is_some() {
            evicted += self.evict(st, self.config.remove_on_fail, Finished::Failed, now);
        }
        evicted
    }

    fn evict(
        &self,
        st: &mut QueueState,
        retention: Retention,
        which: Finished,
        now: DateTime<Utc>,
    ) -> usize {
        let finished = match which {
            Finished::Completed => &mut st.completed,
            Finished::Failed => &mut st.failed,
        };

        let mut evicted = Vec::new();
        if let Some(max) = retention.max_count {
            while finished.len() > max {
                if let Some(id) = finished.pop_front() {
                    evicted.push(id);
                }
            }
        }
        if let Some(age) = retention.max_age {
            let cutoff = deadline_before(now, age);
            while let Some(id) = finished.front().copied() {
                let expired = st
                    .jobs
                    .get(&id)
                    .and_then(|job| job.finished_at)
                    .is_none_or(|at| at <= cutoff);
                if !expired {
                    break;
                }
                finished.pop_front();
                evicted.push(id);
            }
        }

        for id in &evicted {
            st.jobs.remove(id);
            self.persist("remove", *id, self.store.remove(&self.name, *id));
        }
        if !evicted.is_empty() {
            debug!(queue = %self.name, count = evicted.len(), "finished jobs evicted");
            metrics::jobs_evicted().add(
                evicted.len() as u64,
                &[KeyValue::new("queue", self.name.clone())],
            );
        }
        evicted.len()
    }
}

fn resolve_waiters(waiters: &mut HashMap<JobId, Vec<oneshot::Sender<Job>>>, job: &Job) {
    for tx in waiters.remove(&job.id).into_iter().flatten() {
        let _ = tx.send(job.clone());
    }
}

/// The job, if it is still active on `attempt`.
fn current_attempt(
    jobs: &mut HashMap<JobId, Job>,
    id: JobId,
    attempt: u32,
) -> Result<&mut Job> {
    let job = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
    if job.state != State::Active || job.attempts != attempt {
        return Err(Error::Cancelled);
    }
    Ok(job)
}
