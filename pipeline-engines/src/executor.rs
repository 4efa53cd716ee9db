//! Executors for lazily evaluated engine work.
//!
//! Engine computations are synchronous, so the default executor runs them
//! on the blocking pool of a dedicated tokio runtime. The pool is sized to
//! the number of logical CPUs and shared by every engine that does not
//! supply its own factory.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use pipeline_core::{PipelineError, PipelineResult};

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Creates the executor an engine dispatches its lazy work to.
pub type ExecutorFactory = Arc<dyn Fn() -> PipelineResult<Arc<dyn LazyExecutor>> + Send + Sync>;

/// Runs jobs off the calling thread.
pub trait LazyExecutor: Send + Sync {
    /// Queue a job. Must not block until the job completes.
    fn spawn(&self, job: Job) -> PipelineResult<()>;

    /// Stop accepting jobs. Jobs already running are left to finish.
    fn shutdown(&self) {}
}

/// Executor backed by the blocking pool of its own tokio runtime.
pub struct TokioExecutor {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

impl TokioExecutor {
    /// Build an executor whose blocking pool holds at most `threads` threads.
    pub fn new(name: impl Into<String>, threads: usize) -> PipelineResult<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name(name.clone())
            .build()
            .map_err(|e| PipelineError::Executor {
                reason: format!("failed to start runtime '{}': {}", name, e),
            })?;
        debug!(executor = %name, threads = threads.max(1), "Lazy executor started");
        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl LazyExecutor for TokioExecutor {
    fn spawn(&self, job: Job) -> PipelineResult<()> {
        if self.is_shutdown() {
            return Err(PipelineError::Executor {
                reason: format!("executor '{}' has been shut down", self.name),
            });
        }
        // The join handle is dropped; completion is reported through the task.
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!(executor = %self.name, "Lazy executor shut down");
    }
}

impl Drop for TokioExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

static DEFAULT_EXECUTOR: OnceCell<Arc<TokioExecutor>> = OnceCell::new();

/// The process-wide executor used when no factory is configured. Created on
/// first use and never shut down.
pub fn default_executor() -> PipelineResult<Arc<dyn LazyExecutor>> {
    let executor = DEFAULT_EXECUTOR
        .get_or_try_init(|| TokioExecutor::new("pipeline-lazy", num_cpus::get()).map(Arc::new))?;
    Ok(executor.clone() as Arc<dyn LazyExecutor>)
}

/// Whether `executor` is the shared default executor. Elements never shut
/// that one down, even when it reached them through a factory.
pub fn is_default_executor(executor: &Arc<dyn LazyExecutor>) -> bool {
    DEFAULT_EXECUTOR
        .get()
        .is_some_and(|default| std::ptr::addr_eq(Arc::as_ptr(executor), Arc::as_ptr(default)))
}

/// Factory that always hands out the shared default executor.
pub fn default_executor_factory() -> ExecutorFactory {
    Arc::new(default_executor)
}
