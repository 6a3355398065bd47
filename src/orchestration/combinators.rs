//! Task combinators.
//!
//! Each combinator builds a composite [`Task`] that submits its children to
//! the same pool when it runs. Composites never hold a pool slot, so a join
//! of N leaves on a pool of size N cannot deadlock on itself.
//!
//! Failures pass through unchanged: a join whose second child fails reports
//! that child's step, not the join's.

use futures::future::{join_all, try_join, try_join_all};
use std::sync::Arc;

use crate::core::task::{Payload, Task};
use crate::error::{Failure, TaskError};
use crate::orchestration::context::TaskContext;
use crate::orchestration::handle::TaskHandle;
use crate::twlog_trace;

/// Run all `tasks` concurrently and collect their values in input order.
///
/// The first child to fail (by completion time) decides the outcome; the
/// remaining children are cancelled and awaited before the join settles.
/// An empty list succeeds with an empty vector.
pub fn join<V: Payload, E: Payload>(
    name: impl Into<String>,
    tasks: Vec<Task<V, E>>,
) -> Task<Vec<V>, E> {
    Task::composite(name, move |ctx| {
        let tasks = tasks.clone();
        async move {
            let mut handles = Vec::with_capacity(tasks.len());
            for task in tasks {
                match ctx.spawn(task).await {
                    Ok(handle) => handles.push(handle),
                    Err(failure) => {
                        cancel_all(&handles).await;
                        return Err(failure);
                    }
                }
            }
            twlog_trace!("join {}: waiting on {} children", ctx.name(), handles.len());

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(ctx.failure(TaskError::Cancelled)),
                outcome = try_join_all(handles.iter().map(|h| h.wait())) => outcome,
            };
            if outcome.is_err() {
                cancel_all(&handles).await;
            }
            outcome
        }
    })
}

/// Run two tasks of different value types concurrently.
pub fn join2<A: Payload, B: Payload, E: Payload>(
    name: impl Into<String>,
    a: Task<A, E>,
    b: Task<B, E>,
) -> Task<(A, B), E> {
    Task::composite(name, move |ctx| {
        let (a, b) = (a.clone(), b.clone());
        async move {
            let first = ctx.spawn(a).await?;
            let second = match ctx.spawn(b).await {
                Ok(handle) => handle,
                Err(failure) => {
                    cancel_all(std::slice::from_ref(&first)).await;
                    return Err(failure);
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(ctx.failure(TaskError::Cancelled)),
                outcome = try_join(first.wait(), second.wait()) => outcome,
            };
            if outcome.is_err() {
                first.cancel();
                second.cancel();
                tokio::join!(first.settled(), second.settled());
            }
            outcome
        }
    })
}

/// Run `task`, then the task built from its value.
///
/// `next` is never called unless `task` succeeded; a failure of `task`
/// propagates unchanged.
pub fn chain<A, B, E, F>(name: impl Into<String>, task: Task<A, E>, next: F) -> Task<B, E>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A) -> Task<B, E> + Send + Sync + 'static,
{
    let next = Arc::new(next);
    Task::composite(name, move |ctx| {
        let task = task.clone();
        let next = Arc::clone(&next);
        async move {
            let value = run_child(&ctx, task).await?;
            run_child(&ctx, next(value)).await
        }
    })
}

/// Like [`chain`], but building the continuation may itself fail.
///
/// A construction error fails the chain step directly, attributed to
/// the chain's own name.
pub fn try_chain<A, B, E, F>(name: impl Into<String>, task: Task<A, E>, next: F) -> Task<B, E>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A) -> Result<Task<B, E>, E> + Send + Sync + 'static,
{
    let next = Arc::new(next);
    Task::composite(name, move |ctx| {
        let task = task.clone();
        let next = Arc::clone(&next);
        async move {
            let value = run_child(&ctx, task).await?;
            let follow = next(value).map_err(|e| ctx.failure(TaskError::Operation(e)))?;
            run_child(&ctx, follow).await
        }
    })
}

/// Run `task`; if it fails, run the task `recover` builds from the failure.
///
/// `recover` is not called when `task` succeeds or when the fallback itself
/// was cancelled. Returning [`Task::rejected`] from `recover` re-raises the
/// original failure.
pub fn fallback<V, E, F>(name: impl Into<String>, task: Task<V, E>, recover: F) -> Task<V, E>
where
    V: Payload,
    E: Payload,
    F: Fn(Failure<E>) -> Task<V, E> + Send + Sync + 'static,
{
    let recover = Arc::new(recover);
    Task::composite(name, move |ctx| {
        let task = task.clone();
        let recover = Arc::clone(&recover);
        async move {
            match run_child(&ctx, task).await {
                Ok(value) => Ok(value),
                Err(failure) if ctx.is_cancelled() => Err(failure),
                Err(failure) => {
                    twlog_trace!("fallback {}: recovering from {}", ctx.name(), failure.describe());
                    run_child(&ctx, recover(failure)).await
                }
            }
        }
    })
}

/// Submit one child and wait for it, following the parent's cancellation.
async fn run_child<V: Payload, E: Payload>(
    ctx: &TaskContext,
    task: Task<V, E>,
) -> Result<V, Failure<E>> {
    if ctx.is_cancelled() {
        return Err(ctx.failure(TaskError::Cancelled));
    }
    let handle = ctx.spawn(task).await?;
    tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            cancel_all(std::slice::from_ref(&handle)).await;
            Err(ctx.failure(TaskError::Cancelled))
        }
        outcome = handle.wait() => outcome,
    }
}

/// Cancel every handle and wait until each one is terminal.
pub(crate) async fn cancel_all<V, E>(handles: &[TaskHandle<V, E>]) {
    for handle in handles {
        handle.cancel();
    }
    join_all(handles.iter().map(|h| h.settled())).await;
}
