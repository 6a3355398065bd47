//! Execution context handed to every operation.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Payload, Task, TaskId};
use crate::error::{Failure, TaskError};
use crate::orchestration::handle::TaskHandle;
use crate::orchestration::pool::WorkerPool;

/// What an operation gets to see about its own execution.
///
/// The cancellation signal is advisory: the engine never interrupts an
/// operation that ignores it (except to enforce the task's own timeout).
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    name: Arc<str>,
    attempt: u32,
    cancel: CancellationToken,
    pool: WorkerPool,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        name: &str,
        attempt: u32,
        cancel: CancellationToken,
        pool: WorkerPool,
    ) -> Self {
        Self {
            task_id,
            name: Arc::from(name),
            attempt,
            cancel,
            pool,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Zero for the first attempt, incremented on every retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A failure attributed to this task.
    pub(crate) fn failure<E>(&self, error: TaskError<E>) -> Failure<E> {
        Failure::new(self.name.as_ref(), self.task_id, error)
    }

    /// Submit a child task whose cancellation follows this task's.
    pub(crate) async fn spawn<V: Payload, E: Payload>(
        &self,
        task: Task<V, E>,
    ) -> Result<TaskHandle<V, E>, Failure<E>> {
        self.pool.submit_child(task, &self.cancel).await
    }
}
