//! Handles to submitted tasks.
//!
//! A `TaskHandle` is the caller's view of one task execution. All clones
//! share a single record: the state lives in a `watch` channel so any number
//! of waiters can suspend on it, and the outcome is a write-once cell filled
//! in the same critical section as the terminal transition.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::IntoFuture;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Payload, TaskId, TaskState};
use crate::error::{Failure, TaskError};
use crate::orchestration::pool::PoolShared;
use crate::twlog_debug;

struct HandleShared<V, E> {
    id: TaskId,
    name: String,
    state: watch::Sender<TaskState>,
    outcome: OnceLock<Result<V, Failure<E>>>,
    cancel: CancellationToken,
    pool: Weak<PoolShared>,
}

/// Reference to exactly one task execution.
pub struct TaskHandle<V, E> {
    shared: Arc<HandleShared<V, E>>,
}

impl<V, E> Clone for TaskHandle<V, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V, E> std::fmt::Debug for TaskHandle<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<V, E> TaskHandle<V, E> {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        cancel: CancellationToken,
        pool: Weak<PoolShared>,
    ) -> Self {
        let (state, _) = watch::channel(TaskState::Pending);
        Self {
            shared: Arc::new(HandleShared {
                id,
                name,
                state,
                outcome: OnceLock::new(),
                cancel,
                pool,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current state. May be stale by the time the caller looks at it,
    /// unless it is terminal.
    pub fn state(&self) -> TaskState {
        *self.shared.state.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether cancellation has been requested for this task.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Request cooperative cancellation.
    ///
    /// A queued task is removed from the pool queue and settles `Cancelled`
    /// right away. A running task only receives the signal; it settles once
    /// its operation returns.
    pub fn cancel(&self) {
        let dequeued = self.shared.state.send_if_modified(|state| {
            if *state != TaskState::Pending {
                return false;
            }
            let _ = self.shared.outcome.set(Err(Failure::new(
                self.shared.name.clone(),
                self.shared.id,
                TaskError::Cancelled,
            )));
            *state = TaskState::Cancelled;
            true
        });
        self.shared.cancel.cancel();

        if dequeued {
            twlog_debug!("task {} ({}) cancelled while queued", self.name(), self.id().short());
            if let Some(pool) = self.shared.pool.upgrade() {
                pool.remove_queued(self.shared.id);
            }
        }
    }

    /// Wait until the task reaches a terminal state and return that state.
    pub async fn settled(&self) -> TaskState {
        let mut rx = self.shared.state.subscribe();
        let settled = rx.wait_for(|state| state.is_terminal()).await.map(|s| *s);
        // The sender lives as long as `self`, so the channel cannot close.
        settled.unwrap_or_else(|_| self.state())
    }

    /// Pending -> Running. Returns false if the task was cancelled first.
    pub(crate) fn start(&self) -> bool {
        self.shared.state.send_if_modified(|state| {
            if state.can_transition(TaskState::Running) {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Record the final outcome of a running task. Only the first terminal
    /// transition wins.
    ///
    /// The outcome is stored inside the same critical section as the state
    /// change, so readers never see a terminal state without it.
    pub(crate) fn settle(&self, outcome: Result<V, Failure<E>>) -> bool {
        let target = match &outcome {
            Ok(_) => TaskState::Succeeded,
            Err(failure) => failure.error.terminal_state(),
        };
        let mut outcome = Some(outcome);
        self.shared.state.send_if_modified(|state| {
            if *state != TaskState::Running || !state.can_transition(target) {
                return false;
            }
            if let Some(outcome) = outcome.take() {
                let _ = self.shared.outcome.set(outcome);
            }
            *state = target;
            true
        })
    }
}

impl<V: Payload, E: Payload> TaskHandle<V, E> {
    /// The outcome, if the task already settled.
    pub fn try_result(&self) -> Option<Result<V, Failure<E>>> {
        self.shared.outcome.get().cloned()
    }

    /// Wait for the terminal outcome.
    ///
    /// Every caller, on every clone, receives the same result.
    pub async fn wait(&self) -> Result<V, Failure<E>> {
        self.settled().await;
        self.try_result().unwrap_or_else(|| {
            Err(Failure::new(
                self.shared.name.clone(),
                self.shared.id,
                TaskError::Cancelled,
            ))
        })
    }

    /// Wait at most `timeout` for the outcome.
    ///
    /// On expiry this returns `TaskError::TimedOut` and leaves the task
    /// running; call [`cancel`](Self::cancel) to stop it.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<V, Failure<E>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Failure::new(
                self.shared.name.clone(),
                self.shared.id,
                TaskError::TimedOut(timeout),
            )),
        }
    }
}

impl<V: Payload, E: Payload> IntoFuture for TaskHandle<V, E> {
    type Output = Result<V, Failure<E>>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}
