//! Core engine. The public API for declaring queues, submitting jobs and
//! registering processors and listeners.
//!
//! One engine per process. It owns the queues, the store and the event bus.
//! Construct it once at startup and pass it (it is cheap to clone) to every
//! component that needs queue access.

mod dispatcher;
mod queue;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) use queue::Queue;

use crate::config::{EngineConfig, QueueConfig};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind, Listener};
use crate::model::*;
use crate::processor::{Processor, ProcessorOptions};
use crate::storage::{MemoryStore, Store};
use dispatcher::Dispatcher;

/// The job engine. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    queues: Arc<RwLock<HashMap<String, Arc<Queue>>>>,
    /// Stops the dispatcher sweep loop.
    dispatch_cancel: CancellationToken,
    /// Stops event delivery, after buffered events are flushed.
    events_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("queues", &self.queue_names())
            .field("started", &self.is_started())
            .finish()
    }
}

impl Engine {
    /// Create an engine with an in-memory store.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create an engine with default config and an in-memory store.
    pub fn in_memory() -> Self {
        Self::new(EngineConfig::default())
    }

    /// Create an engine journaling through `store`.
    pub fn with_store(config: EngineConfig, store: Arc<dyn Store>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                events: Arc::new(EventBus::new()),
                queues: Arc::new(RwLock::new(HashMap::new())),
                dispatch_cancel: CancellationToken::new(),
                events_cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Declare a queue with the engine's default queue config.
    pub fn declare_queue(&self, name: impl Into<String>) -> Result<()> {
        self.declare_queue_with(name, self.inner.config.queue_defaults.clone())
    }

    /// Declare a queue. Jobs the store holds for it are restored.
    pub fn declare_queue_with(&self, name: impl Into<String>, config: QueueConfig) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidOptions(
                "queue name must not be empty".to_string(),
            ));
        }
        if config.default_max_attempts == 0 {
            return Err(Error::InvalidOptions(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }

        // Held across the restore so a rejected redeclaration never touches
        // the live queue's stored jobs.
        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if queues.contains_key(&name) {
            return Err(Error::InvalidOptions(format!(
                "queue {name} is already declared"
            )));
        }

        let queue = Arc::new(Queue::new(
            name.clone(),
            config,
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.events),
        ));
        let restored = queue.restore(self.inner.store.load(&name)?);
        queues.insert(name.clone(), Arc::clone(&queue));
        drop(queues);

        info!(queue = %name, restored, "queue declared");
        if self.is_started() {
            queue.start();
        }
        Ok(())
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Declared queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    fn queues(&self) -> Vec<Arc<Queue>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The queue holding job `id`.
    fn queue_of(&self, id: JobId) -> Result<Arc<Queue>> {
        self.queues()
            .into_iter()
            .find(|queue| queue.contains(id))
            .ok_or(Error::JobNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Submit a job. Returns its id once it is waiting (or delayed).
    pub fn submit(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        self.queue(queue)?.submit(payload, options)
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.queues()
            .into_iter()
            .find_map(|queue| queue.get(id))
            .ok_or(Error::JobNotFound(id))
    }

    /// Cancel a job. An active job stops at its next suspension point and
    /// fails with reason `cancelled`; a waiting or delayed job fails at once.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        self.queue_of(id)?.cancel(id)
    }

    /// Wait for a job to reach a terminal state and return it.
    pub async fn wait_for_job(&self, id: JobId) -> Result<Job> {
        self.queue_of(id)?.wait_finished(id).await
    }

    /// Wait for a job to finish: its result on success, the matching error
    /// on failure.
    pub async fn finished(&self, id: JobId) -> Result<serde_json::Value> {
        let job = self.wait_for_job(id).await?;
        match job.state {
            State::Completed => Ok(job.result.unwrap_or(serde_json::Value::Null)),
            _ => Err(job
                .error()
                .unwrap_or_else(|| Error::Other(format!("job {id} failed")))),
        }
    }

    pub fn counts(&self, queue: &str) -> Result<JobCounts> {
        Ok(self.queue(queue)?.counts())
    }

    /// Jobs of a queue in `state`, highest priority first, then oldest first.
    pub fn list_by_state(&self, queue: &str, state: State) -> Result<Vec<Job>> {
        Ok(self.queue(queue)?.list_by_state(state))
    }

    /// Evict completed and failed jobs beyond `retention`. Returns the number evicted.
    pub fn remove_completed(&self, queue: &str, retention: Retention) -> Result<usize> {
        let queue = self.queue(queue)?;
        let evicted = queue.remove_completed(retention);
        queue.notify_settled();
        Ok(evicted)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a processor on a queue. Its concurrency adds worker slots.
    pub fn register_handler<P: Processor>(
        &self,
        queue: &str,
        options: ProcessorOptions,
        processor: P,
    ) -> Result<()> {
        self.register_processor(queue, options, Arc::new(processor))
    }

    pub fn register_processor(
        &self,
        queue: &str,
        options: ProcessorOptions,
        processor: Arc<dyn Processor>,
    ) -> Result<()> {
        options.validate()?;
        let q = self.queue(queue)?;
        let slots = options.slots();
        q.register(options.name.clone(), processor, slots)?;
        info!(
            queue,
            name = options.name.as_deref().unwrap_or("default"),
            concurrency = slots,
            "processor registered"
        );
        Ok(())
    }

    pub fn has_processor(&self, queue: &str, name: Option<&str>) -> Result<bool> {
        Ok(self.queue(queue)?.has_processor(&name.map(str::to_string)))
    }

    /// Subscribe a listener to one event kind of a queue.
    pub fn on_event<L: Listener>(&self, queue: &str, kind: EventKind, listener: L) -> Result<()> {
        self.subscribe(queue, kind, Arc::new(listener))
    }

    pub fn subscribe(
        &self,
        queue: &str,
        kind: EventKind,
        listener: Arc<dyn Listener>,
    ) -> Result<()> {
        self.queue(queue)?;
        self.inner.events.on(queue, kind, listener);
        debug!(queue, kind = %kind, "listener registered");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start dispatching and event delivery. Must be called inside a tokio
    /// runtime. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = Vec::new();
        if let Some(handle) = self
            .inner
            .events
            .spawn_delivery(self.inner.events_cancel.clone())
        {
            tasks.push(handle);
        }
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.inner.queues),
            self.inner.config.sweep_interval,
        );
        tasks.push(tokio::spawn(
            dispatcher.run(self.inner.dispatch_cancel.clone()),
        ));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        for queue in self.queues() {
            queue.start();
        }
        info!(queues = self.queue_names().len(), "engine started");
    }

    /// Close every queue and let active jobs finish, then flush pending
    /// events. Jobs still running when the grace period runs out are
    /// interrupted and left waiting in the store for the next start.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        let queues = self.queues();
        for queue in &queues {
            queue.close();
        }
        self.inner.dispatch_cancel.cancel();

        let grace = self.inner.config.shutdown_grace;
        let idle = async {
            for queue in &queues {
                queue.wait_idle().await;
            }
        };
        if tokio::time::timeout(grace, idle).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "active jobs outlived the shutdown grace period, interrupting"
            );
            for queue in &queues {
                queue.interrupt_active();
            }
            for queue in &queues {
                queue.wait_idle().await;
            }
        }

        self.inner.events_cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("engine stopped");
    }
}
