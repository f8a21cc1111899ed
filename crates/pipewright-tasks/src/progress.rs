//! Task progress reporting
//!
//! Progress sinks are passive: they observe task outcomes but never change
//! control flow. The executor wraps each task's sink in a [`FailureLatch`] to
//! learn whether that task reported a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::task::TaskDescriptor;

/// Events emitted while a task runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A task started
    Started { task: TaskDescriptor, message: String },
    /// Intermediate status, e.g. a line of tool output
    Progress { task: TaskDescriptor, message: String },
    /// A task failed
    Failed { task: TaskDescriptor, message: String },
    /// A task finished, either by doing the work or by restoring from the stash
    Completed {
        task: TaskDescriptor,
        message: String,
        cached: bool,
    },
}

impl ProgressEvent {
    /// Task the event is about
    pub fn task(&self) -> &TaskDescriptor {
        match self {
            Self::Started { task, .. }
            | Self::Progress { task, .. }
            | Self::Failed { task, .. }
            | Self::Completed { task, .. } => task,
        }
    }
}

/// Sink for task progress
pub trait Progress: Send + Sync {
    /// Handle a progress event
    fn report(&self, event: &ProgressEvent);

    fn started(&self, task: &TaskDescriptor, message: &str) {
        self.report(&ProgressEvent::Started {
            task: task.clone(),
            message: message.to_string(),
        });
    }

    fn progress(&self, task: &TaskDescriptor, message: &str) {
        self.report(&ProgressEvent::Progress {
            task: task.clone(),
            message: message.to_string(),
        });
    }

    fn failed(&self, task: &TaskDescriptor, message: &str) {
        self.report(&ProgressEvent::Failed {
            task: task.clone(),
            message: message.to_string(),
        });
    }

    fn completed(&self, task: &TaskDescriptor, message: &str) {
        self.report(&ProgressEvent::Completed {
            task: task.clone(),
            message: message.to_string(),
            cached: false,
        });
    }

    fn cached(&self, task: &TaskDescriptor, message: &str) {
        self.report(&ProgressEvent::Completed {
            task: task.clone(),
            message: message.to_string(),
            cached: true,
        });
    }
}

/// Progress sink that logs to tracing
#[derive(Debug, Default)]
pub struct TracingProgress;

impl Progress for TracingProgress {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { task, message } => {
                tracing::info!(task = %task, "started: {}", message);
            }
            ProgressEvent::Progress { task, message } => {
                tracing::debug!(task = %task, "{}", message);
            }
            ProgressEvent::Failed { task, message } => {
                tracing::error!(task = %task, "failed: {}", message);
            }
            ProgressEvent::Completed {
                task,
                message,
                cached,
            } => {
                if *cached {
                    tracing::info!(task = %task, "cached: {}", message);
                } else {
                    tracing::info!(task = %task, "succeeded: {}", message);
                }
            }
        }
    }
}

/// Collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    /// All collected events
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Tasks reported as completed, with their cached flag
    pub fn completed_tasks(&self) -> Vec<(TaskDescriptor, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Completed { task, cached, .. } => Some((task, cached)),
                _ => None,
            })
            .collect()
    }

    /// Tasks reported as failed, with their message
    pub fn failures(&self) -> Vec<(TaskDescriptor, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Failed { task, message } => Some((task, message)),
                _ => None,
            })
            .collect()
    }
}

impl Progress for CollectingProgress {
    fn report(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Broadcasts events to every registered sink
pub struct ProgressRegistry {
    sinks: Vec<Arc<dyn Progress>>,
}

impl ProgressRegistry {
    /// Registry with a tracing sink
    pub fn new() -> Self {
        Self {
            sinks: vec![Arc::new(TracingProgress)],
        }
    }

    pub fn empty() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register<P: Progress + 'static>(&mut self, sink: P) {
        self.sinks.push(Arc::new(sink));
    }

    pub fn register_shared(&mut self, sink: Arc<dyn Progress>) {
        self.sinks.push(sink);
    }

    pub fn all(&self) -> &[Arc<dyn Progress>] {
        &self.sinks
    }
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for ProgressRegistry {
    fn report(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.report(event);
        }
    }
}

/// Forwards events and remembers the first failure reported through it
pub struct FailureLatch<'a> {
    inner: &'a dyn Progress,
    failed: AtomicBool,
    cached: AtomicBool,
    message: Mutex<Option<String>>,
}

impl<'a> FailureLatch<'a> {
    pub fn new(inner: &'a dyn Progress) -> Self {
        Self {
            inner,
            failed: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            message: Mutex::new(None),
        }
    }

    /// Whether any failure was reported
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Whether a cached completion was reported
    pub fn was_cached(&self) -> bool {
        self.cached.load(Ordering::SeqCst)
    }

    /// Message of the first reported failure
    pub fn failure_message(&self) -> Option<String> {
        self.message.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Progress for FailureLatch<'_> {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Failed { message, .. } => {
                if !self.failed.swap(true, Ordering::SeqCst) {
                    *self.message.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());
                }
            }
            ProgressEvent::Completed { cached: true, .. } => {
                self.cached.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        self.inner.report(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskDescriptor {
        TaskDescriptor::new("compile", "a.src", vec![])
    }

    #[test]
    fn test_collecting_progress() {
        let progress = CollectingProgress::default();
        progress.started(&task(), "compiling");
        progress.cached(&task(), "restored");

        assert_eq!(progress.events().len(), 2);
        assert_eq!(progress.completed_tasks(), vec![(task(), true)]);
        assert!(progress.failures().is_empty());
    }

    #[test]
    fn test_tracing_progress() {
        let progress = TracingProgress;
        progress.started(&task(), "compiling");
        progress.progress(&task(), "50%");
        progress.completed(&task(), "done");
        progress.failed(&task(), "boom");
    }

    #[test]
    fn test_registry_broadcast() {
        let collecting = Arc::new(CollectingProgress::default());
        let mut registry = ProgressRegistry::empty();
        registry.register_shared(collecting.clone());
        registry.register(TracingProgress);
        assert_eq!(registry.all().len(), 2);

        registry.completed(&task(), "done");
        assert_eq!(collecting.completed_tasks(), vec![(task(), false)]);
    }

    #[test]
    fn test_failure_latch() {
        let collecting = CollectingProgress::default();
        let latch = FailureLatch::new(&collecting);
        latch.started(&task(), "go");
        assert!(!latch.has_failed());
        latch.cached(&task(), "hit");
        assert!(latch.was_cached());

        latch.failed(&task(), "first");
        latch.failed(&task(), "second");
        assert!(latch.has_failed());
        assert_eq!(latch.failure_message().as_deref(), Some("first"));
        assert_eq!(collecting.failures().len(), 2);
    }

    #[test]
    fn test_event_task() {
        let event = ProgressEvent::Progress {
            task: task(),
            message: String::new(),
        };
        assert_eq!(event.task(), &task());
    }
}
