//! Task data model.
//!
//! A [`Task`] is an immutable description of one unit of asynchronous work:
//! a named operation plus its execution options. Submitting it to a
//! [`WorkerPool`](crate::orchestration::WorkerPool) yields a
//! [`TaskHandle`](crate::orchestration::TaskHandle) that tracks its
//! [`TaskState`].

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::retry::RetryPolicy;
use crate::error::{Failure, TaskError};
use crate::orchestration::TaskContext;
use crate::util::blocking;

/// Values and errors that can flow through the engine.
///
/// Outcomes are written once and handed to every waiter, so they must be
/// cheap to share across threads and clonable.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Execution state of a submitted task.
///
/// ```text
/// Pending ──> Running ──> Succeeded | Failed | Cancelled | TimedOut
///    └──────────────────> Cancelled
/// ```
///
/// No state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, waiting for a slot.
    #[default]
    Pending,
    /// Operation is executing.
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// Check whether moving from `self` to `next` is a legal transition.
    pub fn can_transition(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Cancelled)
                | (TaskState::Running, TaskState::TimedOut)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
            TaskState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Queue priority. Higher priorities are dequeued first; equal priorities
/// keep submission order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

pub(crate) type LeafFn<V, E> =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, std::result::Result<V, E>> + Send + Sync>;

pub(crate) type CompositeFn<V, E> = Arc<
    dyn Fn(TaskContext) -> BoxFuture<'static, std::result::Result<V, Failure<E>>> + Send + Sync,
>;

/// What runs when the task starts.
pub(crate) enum Operation<V, E> {
    /// User work. Occupies a pool slot while running.
    Leaf(LeafFn<V, E>),
    /// Coordination of child tasks. Runs outside the slot limit so that a
    /// parent waiting on its children can never starve them.
    Composite(CompositeFn<V, E>),
}

impl<V, E> Clone for Operation<V, E> {
    fn clone(&self) -> Self {
        match self {
            Operation::Leaf(f) => Operation::Leaf(Arc::clone(f)),
            Operation::Composite(f) => Operation::Composite(Arc::clone(f)),
        }
    }
}

/// A unit of asynchronous work.
///
/// The operation is an `Fn` rather than `FnOnce` so a retry policy can
/// invoke it again; cloning a task is cheap and keeps its id.
pub struct Task<V, E> {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) op: Operation<V, E>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) priority: Priority,
    /// The operation runs on tokio's blocking pool and cannot be stopped
    /// once started.
    pub(crate) blocking: bool,
}

impl<V, E> Clone for Task<V, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            op: self.op.clone(),
            timeout: self.timeout,
            retry: self.retry.clone(),
            priority: self.priority,
            blocking: self.blocking,
        }
    }
}

impl<V, E> std::fmt::Debug for Task<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("composite", &self.is_composite())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("priority", &self.priority)
            .field("blocking", &self.blocking)
            .finish()
    }
}

impl<V: Payload, E: Payload> Task<V, E> {
    /// Create a leaf task from an async operation.
    ///
    /// The operation receives a [`TaskContext`] carrying the cancellation
    /// signal; observing it is the operation's responsibility.
    pub fn new<F, Fut>(name: impl Into<String>, op: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        let op: LeafFn<V, E> = Arc::new(move |ctx| op(ctx).boxed());
        Self::with_operation(name, Operation::Leaf(op))
    }

    /// Create a leaf task from a synchronous operation.
    ///
    /// The closure runs on tokio's blocking pool so it never stalls the
    /// async workers; it still counts against the pool's slot limit. A
    /// timed-out attempt settles on time but keeps its slot until the
    /// closure returns.
    pub fn blocking<F>(name: impl Into<String>, op: F) -> Self
    where
        F: Fn() -> std::result::Result<V, E> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut task = Self::new(name, move |_ctx| {
            let op = Arc::clone(&op);
            async move { blocking(move || op()).await }
        });
        task.blocking = true;
        task
    }

    /// A leaf task that immediately succeeds with `value`.
    pub fn ready(name: impl Into<String>, value: V) -> Self {
        Self::new(name, move |_ctx| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// A leaf task that immediately fails with `error`.
    pub fn fail(name: impl Into<String>, error: E) -> Self {
        Self::new(name, move |_ctx| {
            let error = error.clone();
            async move { Err(error) }
        })
    }

    /// A composite task that re-raises `failure` unchanged.
    ///
    /// Lets a fallback's recovery function decline to recover while keeping
    /// the original step attribution.
    pub fn rejected(failure: Failure<E>) -> Self {
        let name = format!("rejected:{}", failure.step);
        Self::composite(name, move |_ctx| {
            let failure = failure.clone();
            async move { Err(failure) }
        })
    }

    pub(crate) fn composite<F, Fut>(name: impl Into<String>, op: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<V, Failure<E>>> + Send + 'static,
    {
        let op: CompositeFn<V, E> = Arc::new(move |ctx| op(ctx).boxed());
        Self::with_operation(name, Operation::Composite(op))
    }

    fn with_operation(name: impl Into<String>, op: Operation<V, E>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            op,
            timeout: None,
            retry: None,
            priority: Priority::Normal,
            blocking: false,
        }
    }

    /// Bound each attempt of the operation. An attempt that overruns is
    /// cancelled and the task settles `TimedOut` (unless retried).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry failed attempts. On a composite task every attempt rebuilds
    /// and reruns its children.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Queue priority. Composite tasks never wait in the queue, so the
    /// pool ignores it for them.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl<V, E> Task<V, E> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.op, Operation::Composite(_))
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Build the failure record for this task.
    pub(crate) fn failure(&self, error: TaskError<E>) -> Failure<E> {
        Failure::new(self.name.clone(), self.id, error)
    }
}
