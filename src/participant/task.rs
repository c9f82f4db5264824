//! The pluggable work-unit interface invoked for state transitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::model::Message;

/// The terminal result of a task execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The work finished and the transition may be committed.
    Completed,
    /// The work stopped in response to `cancel`, leaving no partial effect.
    Canceled,
    /// The work failed; the transition must not be committed.
    Failed(String),
}

/// A unit of work bound to one state transition.
///
/// `run` may block; it is always executed on a blocking thread. `cancel` must
/// return promptly and cause an in-flight `run` to wind down without leaving
/// partial effects observable to other components.
pub trait Task: Send + Sync + 'static {
    fn run(&self) -> TaskOutcome;

    fn cancel(&self);
}

/// A factory producing task instances for transition messages, registered per
/// state model name.
pub trait TaskFactory: Send + Sync + 'static {
    fn create(&self, message: &Message) -> Arc<dyn Task>;
}

/// The registry of task factories keyed by state model name.
///
/// Swappable at runtime so embedding applications can register handlers after
/// the executor is already running.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: Arc<ArcSwap<HashMap<String, Arc<dyn TaskFactory>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for the given state model, replacing any previous one.
    pub fn register(&self, state_model: impl Into<String>, factory: Arc<dyn TaskFactory>) {
        let state_model = state_model.into();
        let mut factories: HashMap<_, _> = self.factories.load().as_ref().clone();
        factories.insert(state_model, factory);
        self.factories.store(Arc::new(factories));
    }

    pub fn get(&self, state_model: &str) -> Option<Arc<dyn TaskFactory>> {
        self.factories.load().get(state_model).cloned()
    }
}

/// A task which performs no work and completes immediately, unless canceled first.
#[derive(Default)]
pub struct NoopTask {
    canceled: AtomicBool,
}

impl Task for NoopTask {
    fn run(&self) -> TaskOutcome {
        if self.canceled.load(Ordering::Relaxed) {
            TaskOutcome::Canceled
        } else {
            TaskOutcome::Completed
        }
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }
}

/// A factory producing `NoopTask` instances for every transition.
#[derive(Default)]
pub struct NoopTaskFactory;

impl TaskFactory for NoopTaskFactory {
    fn create(&self, _message: &Message) -> Arc<dyn Task> {
        Arc::new(NoopTask::default())
    }
}
