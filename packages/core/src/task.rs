// ABOUTME: Cancellable task primitive shared by the fetcher and the runner
// ABOUTME: Wraps a spawned future with a cancellation token and a shareable result

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Produced by explicit cancellation; not a fault
    #[error("Task aborted")]
    Aborted,

    #[error("Task failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskError::Aborted)
    }

    pub fn failed(reason: impl ToString) -> Self {
        TaskError::Failed(reason.to_string())
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// A running asynchronous computation that can be cancelled and awaited by
/// any number of holders. Every holder observes the same outcome.
pub struct Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    token: CancellationToken,
    result: Shared<BoxFuture<'static, TaskResult<T>>>,
}

impl<T> Clone for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Start `work` on the runtime. Once cancelled the task resolves to
/// [`TaskError::Aborted`] and the work future is dropped at its next suspension point.
pub fn new_task<T, F, Fut>(work: F) -> Task<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
{
    Task::spawn(work, None)
}

/// Like [`new_task`], but cancellation resolves to `sentinel` instead of an error.
pub fn new_task_or<T, F, Fut>(sentinel: T, work: F) -> Task<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
{
    Task::spawn(work, Some(sentinel))
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn spawn<F, Fut>(work: F, sentinel: Option<T>) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let work = work(token.clone());
        let guard = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => Err(TaskError::Aborted),
                outcome = work => outcome,
            }
        });

        let result = async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) if join_error.is_cancelled() => Err(TaskError::Aborted),
                Err(join_error) => Err(TaskError::failed(format!(
                    "task panicked: {}",
                    join_error
                ))),
            };

            match (outcome, sentinel) {
                (Err(TaskError::Aborted), Some(sentinel)) => Ok(sentinel),
                (outcome, _) => outcome,
            }
        }
        .boxed()
        .shared();

        Self { token, result }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("Cancelling task");
            self.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.result.peek().is_some()
    }

    /// Wait for the outcome.
    pub fn result(&self) -> impl Future<Output = TaskResult<T>> + Send + 'static {
        self.result.clone()
    }

    /// Whether both handles refer to the same running task.
    pub fn same_task(&self, other: &Task<T>) -> bool {
        self.result.ptr_eq(&other.result)
    }
}

/// Holds the single live task for one logical key (e.g. "the template load").
/// Replacing the task cancels the previous one.
#[derive(Debug)]
pub struct TaskSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    current: Mutex<Option<Task<T>>>,
}

impl<T> Default for TaskSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Install `task`, cancelling whatever was there before.
    pub fn replace(&self, task: Task<T>) -> Task<T> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            if !previous.same_task(&task) {
                previous.cancel();
            }
        }
        *current = Some(task.clone());
        task
    }

    pub fn current(&self) -> Option<Task<T>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel and forget the current task.
    pub fn cancel(&self) {
        if let Some(task) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.cancel();
        }
    }

    /// Forget `task` if it is still the current one, without cancelling it.
    pub fn clear_if_current(&self, task: &Task<T>) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|c| c.same_task(task)) {
            *current = None;
        }
    }
}
