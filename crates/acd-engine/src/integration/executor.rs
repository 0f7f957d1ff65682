use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;

/// Runs engine side effects and timers
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: BoxFuture<'static, ()>);

    fn execute_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Generic helpers over [`TaskExecutor`]
pub trait TaskExecutorExt {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static;

    fn spawn_delayed<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

impl<T: TaskExecutor + ?Sized> TaskExecutorExt for T {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.execute(task.boxed());
    }

    fn spawn_delayed<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.execute_delayed(delay, task.boxed());
    }
}

/// Executor backed by a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Executor on the runtime of the calling task
    ///
    /// Panics outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl TaskExecutor for TokioExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }

    fn execute_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}
