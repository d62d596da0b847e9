//! Execution contexts for delivery passes, credit grants and timers.

use std::fmt;
use std::time::Duration;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync + fmt::Debug {
    /// Runs `job` as soon as possible.
    fn execute(&self, job: Job);

    /// Runs `job` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, job: Job);
}

/// Runs jobs on the tokio blocking pool. Delivery passes may touch the
/// journal, so they never run on the async worker threads.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Executor bound to the runtime of the calling task.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        drop(self.handle.spawn_blocking(job));
    }

    fn schedule(&self, delay: Duration, job: Job) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                tracing::error!(target: "relaymq::executor", error = %e, "scheduled job failed");
            }
        });
    }
}

/// Runs jobs inline on the calling thread; timers get a short-lived
/// thread each. Used by embedded brokers and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, job: Job) {
        job();
    }

    fn schedule(&self, delay: Duration, job: Job) {
        let spawned = std::thread::Builder::new()
            .name("relaymq-timer".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                job();
            });
        if let Err(e) = spawned {
            tracing::error!(target: "relaymq::executor", error = %e, "failed to spawn timer thread");
        }
    }
}
