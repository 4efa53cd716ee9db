//! Lazily evaluated engine tasks.
//!
//! A [`LazyTask`] is the completion handle for one engine computation that
//! runs on an executor. Readers block on it with a deadline; stopping the
//! owning flow data cancels it and wakes every blocked reader at once.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use pipeline_core::{Cancellable, PipelineError, PipelineResult};

enum TaskState {
    Pending,
    Done(PipelineResult<()>),
    Cancelled,
}

/// How a wait on a [`LazyTask`] ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed,
    Failed(PipelineError),
    TimedOut,
    Cancelled,
}

/// Completion handle for one lazily dispatched engine computation.
pub struct LazyTask {
    engine: String,
    state: Mutex<TaskState>,
    finished: Condvar,
}

impl LazyTask {
    pub fn new(engine: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            engine: engine.into(),
            state: Mutex::new(TaskState::Pending),
            finished: Condvar::new(),
        })
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Record the computation's result. Returns false if the task was
    /// already finished or cancelled, in which case the result is dropped.
    pub fn complete(&self, result: PipelineResult<()>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, TaskState::Pending) {
            return false;
        }
        *state = TaskState::Done(result);
        drop(state);
        self.finished.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), TaskState::Cancelled)
    }

    /// Block until the task finishes, is cancelled, or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> TaskOutcome {
        let mut state = self.state.lock();
        loop {
            let outcome = match &*state {
                TaskState::Done(Ok(())) => Some(TaskOutcome::Completed),
                TaskState::Done(Err(e)) => Some(TaskOutcome::Failed(e.clone())),
                TaskState::Cancelled => Some(TaskOutcome::Cancelled),
                TaskState::Pending => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            if self.finished.wait_until(&mut state, deadline).timed_out()
                && matches!(*state, TaskState::Pending)
            {
                debug!(engine = %self.engine, "Lazy task wait timed out");
                return TaskOutcome::TimedOut;
            }
        }
    }
}

impl Cancellable for LazyTask {
    fn cancel(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TaskState::Pending) {
            *state = TaskState::Cancelled;
            drop(state);
            debug!(engine = %self.engine, "Lazy task cancelled");
            self.finished.notify_all();
        }
    }

    fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), TaskState::Pending)
    }
}

impl fmt::Debug for LazyTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            TaskState::Pending => "pending",
            TaskState::Done(Ok(())) => "completed",
            TaskState::Done(Err(_)) => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.debug_struct("LazyTask")
            .field("engine", &self.engine)
            .field("state", &state)
            .finish()
    }
}

/// Handle over every outstanding task of one result object.
#[derive(Debug, Clone, Default)]
pub struct ProcessHandle {
    tasks: Vec<Arc<LazyTask>>,
}

impl ProcessHandle {
    pub(crate) fn new(tasks: Vec<Arc<LazyTask>>) -> Self {
        Self { tasks }
    }

    /// True once every task has finished or been cancelled.
    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(|t| t.is_done())
    }

    pub fn cancel(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
