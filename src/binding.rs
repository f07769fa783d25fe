//! Explicit processor and listener registration.
//!
//! Components describe what they contribute to a queue as a [`QueueBinding`]
//! built by ordinary code. [`Bindings::bind`] resolves every queue first and
//! registers nothing unless all of them exist.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::event::{EventKind, Listener};
use crate::processor::{Processor, ProcessorOptions};

/// Everything one component contributes to one queue.
pub struct QueueBinding {
    queue: String,
    processors: Vec<(ProcessorOptions, Arc<dyn Processor>)>,
    listeners: Vec<(EventKind, Arc<dyn Listener>)>,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            processors: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn processor(mut self, options: ProcessorOptions, processor: impl Processor) -> Self {
        let processor: Arc<dyn Processor> = Arc::new(processor);
        self.processors.push((options, processor));
        self
    }

    pub fn listener(mut self, kind: EventKind, listener: impl Listener) -> Self {
        let listener: Arc<dyn Listener> = Arc::new(listener);
        self.listeners.push((kind, listener));
        self
    }
}

/// A component that knows its own binding. Shared state lives in the
/// component and is captured by the processors and listeners it hands out.
pub trait QueueComponent: Send + Sync + 'static {
    fn binding(self: Arc<Self>) -> QueueBinding;
}

/// What [`Bindings::bind`] registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindSummary {
    pub processors: usize,
    pub listeners: usize,
}

/// A set of bindings applied to an engine in one step.
#[derive(Default)]
pub struct Bindings {
    bindings: Vec<QueueBinding>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn component<C: QueueComponent>(self, component: Arc<C>) -> Self {
        self.add(component.binding())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Register every binding on `engine`.
    ///
    /// Queues, processor options and processor names are all checked before
    /// the first registration, so a failure leaves the engine untouched.
    pub fn bind(self, engine: &Engine) -> Result<BindSummary> {
        self.check(engine)?;

        let mut summary = BindSummary::default();
        for binding in self.bindings {
            for (options, processor) in binding.processors {
                engine.register_processor(&binding.queue, options, processor)?;
                summary.processors += 1;
            }
            for (kind, listener) in binding.listeners {
                engine.subscribe(&binding.queue, kind, listener)?;
                summary.listeners += 1;
            }
        }

        info!(
            processors = summary.processors,
            listeners = summary.listeners,
            "bindings registered"
        );
        Ok(summary)
    }

    fn check(&self, engine: &Engine) -> Result<()> {
        let mut seen = HashSet::new();
        for binding in &self.bindings {
            if !engine.has_queue(&binding.queue) {
                if binding.queue.is_empty() {
                    error!("no queue was found, check your configuration");
                } else {
                    error!(
                        "no queue was found with the given name ({}), check your configuration",
                        binding.queue
                    );
                }
                return Err(Error::QueueNotFound(binding.queue.clone()));
            }

            for (options, _) in &binding.processors {
                options.validate()?;
                let name = options.name.as_deref();
                let taken = engine.has_processor(&binding.queue, name)?
                    || !seen.insert((binding.queue.as_str(), name));
                if taken {
                    return Err(Error::InvalidOptions(format!(
                        "processor {:?} is bound twice on queue {}",
                        name.unwrap_or("default"),
                        binding.queue
                    )));
                }
            }
        }
        Ok(())
    }
}
