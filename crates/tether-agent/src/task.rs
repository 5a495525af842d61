//! Task records, handlers and the per-task execution context.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tether_common::{Cause, Outcome, TaskId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::slot::SlotId;

/// How a handler ended without producing a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The handler observed its cancellation token and stopped.
    #[error("interrupted")]
    Interrupted,
    /// The handler failed.
    #[error("{0}")]
    Failed(String),
}

/// What a handler sees while it runs.
///
/// Everything a task needs about its surroundings is passed in here rather
/// than read from worker-global state.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    name: String,
    slot: SlotId,
    token: CancellationToken,
}

impl TaskContext {
    /// Id assigned by the controller.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Handler name the task was submitted under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot running the task.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    /// Safe point: fails once the task has been interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`TaskFailure::Interrupted`] after cancellation.
    pub fn checkpoint(&self) -> Result<(), TaskFailure> {
        if self.token.is_cancelled() {
            Err(TaskFailure::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Whether the task has been interrupted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is interrupted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// A named unit of agent-side work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task. Long-running handlers should poll
    /// [`TaskContext::checkpoint`] or select on [`TaskContext::cancelled`].
    async fn run(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<Vec<u8>, TaskFailure>;
}

/// Handlers by name.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TaskRegistry").field("handlers", &names).finish()
    }
}

impl TaskRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Looks up a handler.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, Default)]
struct TaskRecord {
    causes: Vec<Cause>,
    result: Option<Outcome>,
}

#[derive(Debug)]
struct TaskShared {
    id: TaskId,
    name: String,
    token: CancellationToken,
    record: Mutex<TaskRecord>,
}

/// Shared control over one task: interruption and the single terminal
/// result.
#[derive(Debug, Clone)]
pub struct TaskControl {
    inner: Arc<TaskShared>,
}

impl TaskControl {
    pub(crate) fn new(id: TaskId, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TaskShared {
                id,
                name: name.into(),
                token: CancellationToken::new(),
                record: Mutex::new(TaskRecord::default()),
            }),
        }
    }

    pub(crate) fn context(&self, slot: SlotId) -> TaskContext {
        TaskContext {
            task_id: self.inner.id,
            name: self.inner.name.clone(),
            slot,
            token: self.inner.token.clone(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Merges `causes` into the record and cancels the task.
    ///
    /// Causes equal to one already recorded are dropped. Returns `false` if
    /// the task had already concluded, in which case nothing changes.
    pub fn interrupt(&self, causes: impl IntoIterator<Item = Cause>) -> bool {
        let mut record = self.inner.record.lock().unwrap_or_else(PoisonError::into_inner);
        if record.result.is_some() {
            return false;
        }
        for cause in causes {
            if !record.causes.contains(&cause) {
                record.causes.push(cause);
            }
        }
        drop(record);
        self.inner.token.cancel();
        true
    }

    /// Recorded causes, in first-seen order.
    #[must_use]
    pub fn causes(&self) -> Vec<Cause> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .causes
            .clone()
    }

    /// The terminal result, once set.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .result
            .clone()
    }

    /// Sets the terminal result from a handler's return value. Only the
    /// first conclusion counts; later calls return the stored result.
    ///
    /// A task with recorded causes always concludes as interrupted.
    pub(crate) fn conclude(&self, returned: Result<Vec<u8>, TaskFailure>) -> Outcome {
        let mut record = self.inner.record.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = &record.result {
            return existing.clone();
        }
        let outcome = if record.causes.is_empty() {
            match returned {
                Ok(value) => Outcome::Success(value),
                Err(TaskFailure::Failed(message)) => Outcome::Failure(message),
                Err(TaskFailure::Interrupted) => Outcome::Interrupted(Vec::new()),
            }
        } else {
            Outcome::Interrupted(record.causes.clone())
        };
        record.result = Some(outcome.clone());
        outcome
    }
}
