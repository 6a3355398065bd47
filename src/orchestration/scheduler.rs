//! Scheduler for step graphs.
//!
//! The Scheduler drives a [`StepGraph`] inside a composite task: it
//! dispatches every step whose dependencies have succeeded, waits for the
//! next step to finish, and repeats until the graph is done. The first
//! failure cancels all in-flight steps and fails the whole graph.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::dag::StepGraph;
use crate::core::task::{Payload, Task, TaskId, TaskState};
use crate::error::{Failure, TaskError};
use crate::orchestration::combinators::cancel_all;
use crate::orchestration::context::TaskContext;
use crate::orchestration::handle::TaskHandle;
use crate::orchestration::orchestrator::Workflow;
use crate::util::panic_message;
use crate::{twlog_debug, twlog_warn};

/// Events emitted by the scheduler for step lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A step's task has been built and submitted.
    StepStarted {
        step: String,
        task_id: TaskId,
    },
    StepCompleted {
        step: String,
    },
    /// A step failed; `failed_step` is where the failure originated, which
    /// differs from `step` when the step is itself a composite.
    StepFailed {
        step: String,
        failed_step: String,
        state: TaskState,
    },
    /// All steps in the graph have completed.
    AllStepsComplete,
}

/// Executes one run of a step graph.
pub(crate) struct Scheduler<V, E> {
    graph: Arc<StepGraph<V, E>>,
    ctx: TaskContext,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    /// Steps that have succeeded.
    completed: HashSet<String>,
    /// Submitted steps that have not finished yet.
    in_flight: HashMap<String, TaskHandle<V, E>>,
    /// Outputs of completed steps.
    results: HashMap<String, V>,
}

impl<V: Payload, E: Payload> Scheduler<V, E> {
    pub(crate) fn new(
        graph: Arc<StepGraph<V, E>>,
        ctx: TaskContext,
        event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Self {
        Self {
            graph,
            ctx,
            event_tx,
            completed: HashSet::new(),
            in_flight: HashMap::new(),
            results: HashMap::new(),
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Steps that can be dispatched now.
    fn ready_steps(&self) -> Vec<String> {
        let in_flight: HashSet<String> = self.in_flight.keys().cloned().collect();
        self.graph
            .ready_steps(&self.completed, &in_flight)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Build and submit every ready step. Returns the number dispatched.
    async fn dispatch_ready_steps(&mut self) -> Result<usize, Failure<E>> {
        let mut dispatched = 0;
        for step in self.ready_steps() {
            let inputs = self.inputs_for(&step);
            let graph = Arc::clone(&self.graph);
            let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
                graph.build_step(&step, &inputs)
            }));
            let task = match built {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    return Err(Failure::new(
                        step,
                        self.ctx.task_id(),
                        TaskError::Panicked(message),
                    ));
                }
            };

            let handle = self.ctx.spawn(task).await?;
            twlog_debug!(
                "graph {}: dispatched step {} ({})",
                self.ctx.name(),
                step,
                handle.id().short()
            );
            self.emit(SchedulerEvent::StepStarted {
                step: step.clone(),
                task_id: handle.id(),
            });
            self.in_flight.insert(step, handle);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Outputs of `step`'s direct dependencies.
    fn inputs_for(&self, step: &str) -> HashMap<String, V> {
        self.graph
            .dependencies(step)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|dep| {
                self.results
                    .get(dep)
                    .map(|value| (dep.to_string(), value.clone()))
            })
            .collect()
    }

    fn handle_completion(&mut self, step: String, value: V) {
        self.in_flight.remove(&step);
        self.results.insert(step.clone(), value);
        self.completed.insert(step.clone());
        self.emit(SchedulerEvent::StepCompleted { step });

        if self.graph.all_complete(&self.completed) {
            self.emit(SchedulerEvent::AllStepsComplete);
        }
    }

    fn handle_failure(&mut self, step: String, failure: &Failure<E>) {
        self.in_flight.remove(&step);
        twlog_warn!("graph {}: step {}: {}", self.ctx.name(), step, failure.describe());
        self.emit(SchedulerEvent::StepFailed {
            step,
            failed_step: failure.step.clone(),
            state: failure.error.terminal_state(),
        });
    }

    async fn cancel_in_flight(&mut self) {
        let handles: Vec<TaskHandle<V, E>> = self.in_flight.drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            twlog_debug!(
                "graph {}: cancelling {} in-flight steps",
                self.ctx.name(),
                handles.len()
            );
        }
        cancel_all(&handles).await;
    }

    /// Run the scheduling loop until every step has succeeded, one has
    /// failed, or the graph task is cancelled.
    pub(crate) async fn run(mut self) -> Result<HashMap<String, V>, Failure<E>> {
        loop {
            if self.graph.all_complete(&self.completed) {
                break;
            }

            if let Err(failure) = self.dispatch_ready_steps().await {
                self.cancel_in_flight().await;
                return Err(failure);
            }

            // Nothing running and nothing dispatchable: the remaining steps
            // can never become ready.
            if self.active_count() == 0 {
                break;
            }

            let mut waits: FuturesUnordered<_> = self
                .in_flight
                .iter()
                .map(|(step, handle)| {
                    let step = step.clone();
                    let handle = handle.clone();
                    async move {
                        let outcome = handle.wait().await;
                        (step, outcome)
                    }
                })
                .collect();

            let next = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => None,
                next = waits.next() => next,
            };
            drop(waits);

            match next {
                Some((step, Ok(value))) => self.handle_completion(step, value),
                Some((step, Err(failure))) => {
                    self.handle_failure(step, &failure);
                    self.cancel_in_flight().await;
                    return Err(failure);
                }
                None => {
                    self.cancel_in_flight().await;
                    return Err(self.ctx.failure(TaskError::Cancelled));
                }
            }
        }

        Ok(std::mem::take(&mut self.results))
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

impl<V: Payload, E: Payload> StepGraph<V, E> {
    /// A composite task that runs the whole graph and yields every step's
    /// output keyed by step name.
    pub fn to_task(&self, name: impl Into<String>) -> Task<HashMap<String, V>, E> {
        self.scheduled_task(name, None)
    }

    /// Like [`to_task`](Self::to_task), reporting step events on `event_tx`.
    pub fn to_task_with_events(
        &self,
        name: impl Into<String>,
        event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Task<HashMap<String, V>, E> {
        self.scheduled_task(name, Some(event_tx))
    }

    fn scheduled_task(
        &self,
        name: impl Into<String>,
        event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Task<HashMap<String, V>, E> {
        let graph = Arc::new(self.clone());
        Task::composite(name, move |ctx| {
            Scheduler::new(Arc::clone(&graph), ctx, event_tx.clone()).run()
        })
    }
}

impl<V: Payload, E: Payload> Workflow for StepGraph<V, E> {
    type Input = ();
    type Output = HashMap<String, V>;
    type Error = E;

    fn name(&self) -> &str {
        StepGraph::name(self)
    }

    fn build(&self, _input: ()) -> Task<Self::Output, Self::Error> {
        self.to_task(StepGraph::name(self))
    }
}
