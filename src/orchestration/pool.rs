//! Bounded worker pool.
//!
//! The `WorkerPool` runs leaf tasks with at most `max_concurrency` of them
//! executing at once and queues the rest by priority, then submission order.
//! Composite tasks (joins, chains, fallbacks, step graphs) start right away
//! and do not take a slot: they only wait on children that do.
//!
//! All mutable pool state (phase, running count, queue) sits behind one
//! mutex whose critical sections never await. A bounded queue hands out its
//! entries as semaphore permits, so submitters waiting for space are admitted
//! in arrival order.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PoolConfig};
use crate::core::retry::RetryPolicy;
use crate::core::task::{
    CompositeFn, LeafFn, Operation, Payload, Priority, Task, TaskId, TaskState,
};
use crate::error::{Failure, Result, TaskError};
use crate::orchestration::context::TaskContext;
use crate::orchestration::handle::TaskHandle;
use crate::util::panic_message;
use crate::{twlog, twlog_debug, twlog_trace, twlog_warn};

/// Events emitted by the pool for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A leaf task is waiting for a slot.
    Queued {
        task_id: TaskId,
        name: String,
        /// Number of queued tasks including this one.
        depth: usize,
    },
    /// A task began executing.
    Started { task_id: TaskId, name: String },
    /// An attempt failed and another one is scheduled.
    Retrying {
        task_id: TaskId,
        name: String,
        /// The retry about to run (1 for the first retry).
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// A task that started has reached a terminal state.
    Finished {
        task_id: TaskId,
        name: String,
        state: TaskState,
    },
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub running: usize,
    pub queued: usize,
    pub composites: usize,
    pub peak_running: usize,
    pub submitted: u64,
    /// Tasks that gave back their slot or composite registration.
    pub finished: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    /// Shutting down but letting accepted work finish. Children of
    /// accepted composites are still admitted.
    Draining,
    Closed,
}

impl Phase {
    fn admits(&self, child: bool) -> bool {
        match self {
            Phase::Open => true,
            Phase::Draining => child,
            Phase::Closed => false,
        }
    }
}

/// A type-erased submitted task.
trait Job: Send {
    fn start(self: Box<Self>, pool: WorkerPool);
    /// Drop a queued job without running it.
    fn abort(self: Box<Self>);
}

struct QueueEntry {
    priority: Priority,
    seq: u64,
    task_id: TaskId,
    job: Box<dyn Job>,
    /// Queue space of a bounded pool, given back when the entry leaves.
    _permit: Option<OwnedSemaphorePermit>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    phase: Phase,
    running: usize,
    composites: usize,
    queue: BinaryHeap<QueueEntry>,
    next_seq: u64,
    peak_running: usize,
    submitted: u64,
    finished: u64,
}

impl PoolState {
    fn is_idle(&self) -> bool {
        self.running == 0 && self.composites == 0 && self.queue.is_empty()
    }

    fn claim_slot(&mut self) {
        self.running += 1;
        self.peak_running = self.peak_running.max(self.running);
    }
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    /// Applied to leaf tasks that carry no retry policy of their own.
    default_retry: Option<RetryPolicy>,
    state: Mutex<PoolState>,
    /// One permit per queue entry when the queue is bounded.
    queue_permits: Option<Arc<Semaphore>>,
    /// Signalled whenever the phase changes.
    phase_changed: Notify,
    /// Signalled whenever the pool may have become idle.
    idle: Notify,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Pool bookkeeping is updated in single statements, so a poisoned
        // lock still holds consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove a cancelled task from the queue.
    pub(crate) fn remove_queued(&self, task_id: TaskId) {
        let (removed, idle) = {
            let mut state = self.lock();
            let before = state.queue.len();
            state.queue.retain(|entry| entry.task_id != task_id);
            (state.queue.len() != before, state.is_idle())
        };
        if removed {
            twlog_trace!("pool: removed {} from queue", task_id.short());
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Bounded executor for tasks.
///
/// Cloning is cheap; all clones drive the same pool.
///
/// # Example
///
/// ```ignore
/// use taskweave::config::PoolConfig;
/// use taskweave::core::Task;
/// use taskweave::orchestration::WorkerPool;
///
/// let pool = WorkerPool::new(PoolConfig::new(3))?;
/// let handle = pool.submit(Task::<u32, String>::ready("answer", 42)).await?;
/// assert_eq!(handle.wait().await?, 42);
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool. Fails if the configuration is invalid.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::build(config, None, None)
    }

    /// Create a pool from the `[pool]` and `[retry]` sections of a config file.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::build(config.pool, config.retry.clone(), None)
    }

    /// Create a pool that reports lifecycle events on `event_tx`.
    pub fn with_events(
        config: PoolConfig,
        event_tx: mpsc::UnboundedSender<PoolEvent>,
    ) -> Result<Self> {
        Self::build(config, None, Some(event_tx))
    }

    /// Like [`from_config`](Self::from_config), reporting events on `event_tx`.
    pub fn from_config_with_events(
        config: &Config,
        event_tx: mpsc::UnboundedSender<PoolEvent>,
    ) -> Result<Self> {
        Self::build(config.pool, config.retry.clone(), Some(event_tx))
    }

    fn build(
        config: PoolConfig,
        default_retry: Option<RetryPolicy>,
        events: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        twlog!(
            "pool: created with max_concurrency={} queue_capacity={}",
            config.max_concurrency,
            config.queue_capacity
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                default_retry,
                state: Mutex::new(PoolState {
                    phase: Phase::Open,
                    running: 0,
                    composites: 0,
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                    peak_running: 0,
                    submitted: 0,
                    finished: 0,
                }),
                queue_permits: (config.queue_capacity > 0)
                    .then(|| Arc::new(Semaphore::new(config.queue_capacity))),
                phase_changed: Notify::new(),
                idle: Notify::new(),
                events,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            running: state.running,
            queued: state.queue.len(),
            composites: state.composites,
            peak_running: state.peak_running,
            submitted: state.submitted,
            finished: state.finished,
        }
    }

    /// Whether new submissions are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.lock().phase == Phase::Open
    }

    /// Submit a task, waiting for queue space if the queue is bounded and full.
    pub async fn submit<V: Payload, E: Payload>(
        &self,
        task: Task<V, E>,
    ) -> std::result::Result<TaskHandle<V, E>, Failure<E>> {
        self.admit(task, CancellationToken::new(), false).await
    }

    /// Submit a task without waiting.
    ///
    /// A full bounded queue rejects the task with `TaskError::PoolExhausted`.
    pub fn try_submit<V: Payload, E: Payload>(
        &self,
        task: Task<V, E>,
    ) -> std::result::Result<TaskHandle<V, E>, Failure<E>> {
        self.try_admit(task, CancellationToken::new(), false, None)
            .map_err(|rejected| rejected.task.failure(rejected.error))
    }

    /// Submit a child of an accepted composite task.
    pub(crate) async fn submit_child<V: Payload, E: Payload>(
        &self,
        task: Task<V, E>,
        parent: &CancellationToken,
    ) -> std::result::Result<TaskHandle<V, E>, Failure<E>> {
        self.admit(task, parent.child_token(), true).await
    }

    async fn admit<V: Payload, E: Payload>(
        &self,
        mut task: Task<V, E>,
        mut token: CancellationToken,
        child: bool,
    ) -> std::result::Result<TaskHandle<V, E>, Failure<E>> {
        let mut permit = None;
        loop {
            let phase_changed = self.shared.phase_changed.notified();
            tokio::pin!(phase_changed);
            phase_changed.as_mut().enable();

            let rejected = match self.try_admit(task, token, child, permit.take()) {
                Ok(handle) => return Ok(handle),
                Err(rejected) => rejected,
            };
            let exhausted = matches!(rejected.error, TaskError::PoolExhausted { .. });
            let permits = match (exhausted, self.shared.queue_permits.as_ref()) {
                (true, Some(permits)) => Arc::clone(permits),
                _ => return Err(rejected.task.failure(rejected.error)),
            };

            let Rejected { task: t, token: k, .. } = rejected;
            twlog_trace!("pool: queue full, {} waits for space", t.name);
            tokio::select! {
                _ = k.cancelled() => return Err(t.failure(TaskError::Cancelled)),
                // A closed semaphore means the pool closed; retrying reports it.
                acquired = permits.acquire_owned() => permit = acquired.ok(),
                _ = &mut phase_changed => {}
            }
            task = t;
            token = k;
        }
    }

    fn try_admit<V: Payload, E: Payload>(
        &self,
        task: Task<V, E>,
        token: CancellationToken,
        child: bool,
        permit: Option<OwnedSemaphorePermit>,
    ) -> std::result::Result<TaskHandle<V, E>, Rejected<V, E>> {
        let handle = TaskHandle::new(
            task.id,
            task.name.clone(),
            token.clone(),
            Arc::downgrade(&self.shared),
        );
        let priority = task.priority;
        let composite = task.is_composite();
        let job = TaskJob {
            task,
            token,
            handle: handle.clone(),
        };

        let mut state = self.shared.lock();
        if !state.phase.admits(child) {
            drop(state);
            return Err(job.reject(TaskError::PoolShutdown));
        }

        if composite {
            state.composites += 1;
            state.submitted += 1;
            drop(state);
            if priority != Priority::Normal {
                twlog_warn!(
                    "pool: composite {} never queues, priority {:?} has no effect",
                    handle.name(),
                    priority
                );
            }
            Box::new(job).start(self.clone());
            return Ok(handle);
        }

        if state.running < self.shared.config.max_concurrency {
            state.claim_slot();
            state.submitted += 1;
            drop(state);
            Box::new(job).start(self.clone());
            return Ok(handle);
        }

        let permit = match &self.shared.queue_permits {
            None => None,
            Some(permits) => match permit.or_else(|| Arc::clone(permits).try_acquire_owned().ok()) {
                Some(permit) => Some(permit),
                None => {
                    drop(state);
                    let capacity = self.shared.config.queue_capacity;
                    return Err(job.reject(TaskError::PoolExhausted { capacity }));
                }
            },
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.submitted += 1;
        state.queue.push(QueueEntry {
            priority,
            seq,
            task_id: handle.id(),
            job: Box::new(job),
            _permit: permit,
        });
        let depth = state.queue.len();
        drop(state);

        twlog_trace!("pool: queued {} at depth {}", handle.name(), depth);
        self.shared.emit(PoolEvent::Queued {
            task_id: handle.id(),
            name: handle.name().to_string(),
            depth,
        });
        Ok(handle)
    }

    /// Give back a slot (leaf) or composite registration and start the
    /// next queued task, if any.
    fn release(&self, composite: bool) {
        let (next, idle) = {
            let mut state = self.shared.lock();
            state.finished += 1;
            let next = if composite {
                state.composites -= 1;
                None
            } else {
                state.running -= 1;
                let next = state.queue.pop();
                if next.is_some() {
                    state.claim_slot();
                }
                next
            };
            (next, state.is_idle())
        };

        if let Some(entry) = next {
            entry.job.start(self.clone());
        }
        if idle {
            self.shared.idle.notify_waiters();
        }
    }

    /// Stop accepting submissions and wait for the pool to go idle.
    ///
    /// With `drain`, queued tasks still run. Without it, queued tasks are
    /// cancelled immediately; running tasks always finish.
    pub async fn shutdown(&self, drain: bool) {
        let aborted: Vec<QueueEntry> = {
            let mut state = self.shared.lock();
            if drain {
                if state.phase == Phase::Open {
                    state.phase = Phase::Draining;
                }
                Vec::new()
            } else {
                state.phase = Phase::Closed;
                std::mem::take(&mut state.queue).into_vec()
            }
        };
        twlog!(
            "pool: shutting down (drain={}, cancelled {} queued)",
            drain,
            aborted.len()
        );
        if !drain {
            self.close_queue();
        }
        self.shared.phase_changed.notify_waiters();
        for entry in aborted {
            entry.job.abort();
        }

        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.lock().is_idle() {
                break;
            }
            idle.await;
        }

        self.shared.lock().phase = Phase::Closed;
        self.close_queue();
        self.shared.phase_changed.notify_waiters();
        twlog!("pool: shut down");
    }

    /// Fail every submitter still waiting for queue space.
    fn close_queue(&self) {
        if let Some(permits) = &self.shared.queue_permits {
            permits.close();
        }
    }

    fn emit(&self, event: PoolEvent) {
        self.shared.emit(event);
    }
}

struct Rejected<V, E> {
    task: Task<V, E>,
    token: CancellationToken,
    error: TaskError<E>,
}

struct TaskJob<V, E> {
    task: Task<V, E>,
    token: CancellationToken,
    handle: TaskHandle<V, E>,
}

impl<V, E> TaskJob<V, E> {
    fn reject(self, error: TaskError<E>) -> Rejected<V, E> {
        Rejected {
            task: self.task,
            token: self.token,
            error,
        }
    }
}

impl<V: Payload, E: Payload> Job for TaskJob<V, E> {
    fn start(self: Box<Self>, pool: WorkerPool) {
        tokio::spawn(async move {
            let TaskJob {
                task,
                token,
                handle,
            } = *self;
            let composite = task.is_composite();
            let mut lingering = None;

            if handle.start() {
                twlog_debug!("task {} ({}) started", task.name, task.id.short());
                pool.emit(PoolEvent::Started {
                    task_id: task.id,
                    name: task.name.clone(),
                });

                let outcome = execute(&task, &token, &pool, &mut lingering).await;
                if let Err(failure) = &outcome {
                    twlog_warn!(
                        "task {} ({}): {}",
                        task.name,
                        task.id.short(),
                        failure.describe()
                    );
                }
                handle.settle(outcome);

                twlog_debug!("task {} ({}) {}", task.name, task.id.short(), handle.state());
                pool.emit(PoolEvent::Finished {
                    task_id: task.id,
                    name: task.name.clone(),
                    state: handle.state(),
                });
            }

            if let Some(rest) = lingering {
                twlog_debug!(
                    "task {} ({}) keeps its slot until its blocking call returns",
                    task.name,
                    task.id.short()
                );
                rest.await;
            }
            pool.release(composite);
        });
    }

    fn abort(self: Box<Self>) {
        self.handle.cancel();
    }
}

/// A timed-out blocking attempt that is still running.
type Lingering = Option<BoxFuture<'static, ()>>;

/// Run a task to its outcome, including retries and timeouts.
///
/// A blocking attempt abandoned by its timeout is left in `lingering`; the
/// caller holds the slot until it returns.
async fn execute<V: Payload, E: Payload>(
    task: &Task<V, E>,
    token: &CancellationToken,
    pool: &WorkerPool,
    lingering: &mut Lingering,
) -> std::result::Result<V, Failure<E>> {
    match &task.op {
        Operation::Leaf(op) => run_leaf(task, op, token, pool, lingering).await,
        Operation::Composite(op) => run_composite(task, op, token, pool).await,
    }
}

async fn run_leaf<V: Payload, E: Payload>(
    task: &Task<V, E>,
    op: &LeafFn<V, E>,
    token: &CancellationToken,
    pool: &WorkerPool,
    lingering: &mut Lingering,
) -> std::result::Result<V, Failure<E>> {
    let mut retries = 0;
    loop {
        let attempt_token = token.child_token();
        let ctx = TaskContext::new(
            task.id,
            &task.name,
            retries,
            attempt_token.clone(),
            pool.clone(),
        );
        let mut attempt = guarded(op(ctx))
            .map(|outcome| match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::Operation(e)),
                Err(panic) => Err(TaskError::Panicked(panic)),
            })
            .boxed();

        let result = match task.timeout {
            None => attempt.await,
            Some(limit) => {
                let timed = tokio::time::timeout(limit, &mut attempt).await;
                match timed {
                    Ok(result) => result,
                    Err(_) => {
                        attempt_token.cancel();
                        if task.blocking {
                            *lingering = Some(attempt.map(|_| ()).boxed());
                        }
                        Err(TaskError::TimedOut(limit))
                    }
                }
            }
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        // A failure after cancellation was requested is the cancellation.
        if token.is_cancelled() {
            return Err(task.failure(TaskError::Cancelled));
        }

        let policy = task.retry.as_ref().or(pool.shared.default_retry.as_ref());
        let Some(delay) = retry_delay(policy, &error, retries) else {
            return Err(task.failure(error));
        };

        retries += 1;
        if !back_off(task, token, pool, retries, delay, error.describe()).await {
            return Err(task.failure(TaskError::Cancelled));
        }
        if let Some(rest) = lingering.take() {
            rest.await;
        }
    }
}

/// Run a composite task. Each attempt gets a fresh context, so a retry
/// rebuilds and resubmits every child.
async fn run_composite<V: Payload, E: Payload>(
    task: &Task<V, E>,
    op: &CompositeFn<V, E>,
    token: &CancellationToken,
    pool: &WorkerPool,
) -> std::result::Result<V, Failure<E>> {
    let mut retries = 0;
    loop {
        let attempt_token = token.child_token();
        let ctx = TaskContext::new(
            task.id,
            &task.name,
            retries,
            attempt_token.clone(),
            pool.clone(),
        );
        let run = guarded(op(ctx));
        tokio::pin!(run);

        let outcome = match task.timeout {
            None => run.await,
            Some(limit) => {
                tokio::select! {
                    outcome = &mut run => outcome,
                    _ = tokio::time::sleep(limit) => {
                        // Let the composite cancel and collect its children
                        // before reporting the timeout.
                        attempt_token.cancel();
                        let _ = run.await;
                        Ok(Err(task.failure(TaskError::TimedOut(limit))))
                    }
                }
            }
        };

        let failure = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(failure)) => failure,
            Err(panic) => task.failure(TaskError::Panicked(panic)),
        };

        if token.is_cancelled() {
            return Err(failure);
        }
        let Some(delay) = retry_delay(task.retry.as_ref(), &failure.error, retries) else {
            return Err(failure);
        };

        retries += 1;
        if !back_off(task, token, pool, retries, delay, failure.describe()).await {
            return Err(task.failure(TaskError::Cancelled));
        }
    }
}

/// Delay before the next attempt, or `None` when the failure is final.
fn retry_delay<E>(
    policy: Option<&RetryPolicy>,
    error: &TaskError<E>,
    retries: u32,
) -> Option<Duration> {
    match policy {
        Some(policy) if error.is_retryable() => policy.next_delay(retries),
        _ => None,
    }
}

/// Announce retry number `attempt` and sleep through its backoff.
///
/// Returns false if the task was cancelled while waiting.
async fn back_off<V, E>(
    task: &Task<V, E>,
    token: &CancellationToken,
    pool: &WorkerPool,
    attempt: u32,
    delay: Duration,
    error: String,
) -> bool {
    twlog_warn!(
        "task {} ({}) attempt {} failed ({}), retrying in {:?}",
        task.name,
        task.id.short(),
        attempt,
        error,
        delay
    );
    pool.emit(PoolEvent::Retrying {
        task_id: task.id,
        name: task.name.clone(),
        attempt,
        delay,
        error,
    });

    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Catch panics from an operation future.
async fn guarded<T>(fut: impl Future<Output = T>) -> std::result::Result<T, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}
