//! Persistence boundary.
//!
//! The engine keeps its dispatch state in memory and journals every job
//! transition through a [`Store`]. A durable implementation lets a fresh
//! process pick up where the last one stopped: on queue declaration the
//! engine loads the queue's jobs back and re-queues anything that was active.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::model::{Job, JobId};

/// Uniform store contract.
///
/// Calls happen while the owning queue holds its mutation lock, so
/// implementations must not call back into the engine.
pub trait Store: Send + Sync {
    /// Record a job that is waiting or delayed (insert or overwrite).
    fn enqueue(&self, job: &Job) -> Result<()>;

    /// Record that a job was leased to a worker slot.
    fn dequeue(&self, job: &Job) -> Result<()>;

    /// Record a job's terminal outcome.
    fn ack(&self, job: &Job) -> Result<()>;

    /// Drop a job record. Unknown ids are not an error.
    fn remove(&self, queue: &str, id: JobId) -> Result<()>;

    /// All jobs recorded for a queue, in insertion order.
    fn load(&self, queue: &str) -> Result<Vec<Job>>;
}

/// In-memory store. Survives engine restarts as long as it is shared.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, HashMap<JobId, Job>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of job records across all queues.
    pub fn len(&self) -> usize {
        self.lock()
            .map(|queues| queues.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, HashMap<JobId, Job>>>> {
        self.queues
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn put(&self, job: &Job) -> Result<()> {
        self.lock()?
            .entry(job.queue.clone())
            .or_default()
            .insert(job.id, job.clone());
        Ok(())
    }
}

impl Store for MemoryStore {
    fn enqueue(&self, job: &Job) -> Result<()> {
        self.put(job)
    }

    fn dequeue(&self, job: &Job) -> Result<()> {
        self.put(job)
    }

    fn ack(&self, job: &Job) -> Result<()> {
        self.put(job)
    }

    fn remove(&self, queue: &str, id: JobId) -> Result<()> {
        if let Some(jobs) = self.lock()?.get_mut(queue) {
            jobs.remove(&id);
        }
        Ok(())
    }

    fn load(&self, queue: &str) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .lock()?
            .get(queue)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default();
        jobs.sort_by_key(|job| job.seq);
        Ok(jobs)
    }
}
