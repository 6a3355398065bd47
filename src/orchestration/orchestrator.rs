//! Workflow runs.
//!
//! An [`Orchestrator`] turns a [`Workflow`] input into a task graph, submits
//! it to a [`WorkerPool`], and tracks the run through a validated status
//! machine:
//!
//! ```text
//! Submitted ──> Running ──> Completed | Failed | Cancelled | TimedOut
//!     └──────────────────> Failed | Cancelled | TimedOut
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::core::task::{Payload, Task};
use crate::error::{Error, Failure, Result, TaskError};
use crate::orchestration::pool::WorkerPool;
use crate::{twlog, twlog_debug, twlog_error, twlog_warn};

/// A business process expressed as a task graph.
pub trait Workflow: Send + Sync + 'static {
    type Input;
    type Output: Payload;
    type Error: Payload;

    fn name(&self) -> &str;

    /// Build the task graph for one run.
    fn build(&self, input: Self::Input) -> Task<Self::Output, Self::Error>;
}

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Submitted | RunStatus::Running)
    }

    /// Check if a transition to `target` is valid from this status.
    pub fn can_transition(&self, target: RunStatus) -> bool {
        matches!(
            (self, target),
            (RunStatus::Submitted, RunStatus::Running)
                | (RunStatus::Submitted, RunStatus::Failed)
                | (RunStatus::Submitted, RunStatus::Cancelled)
                | (RunStatus::Submitted, RunStatus::TimedOut)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::TimedOut)
        )
    }

    /// Terminal status for a run that ended with `failure`.
    pub fn from_failure<E>(failure: &Failure<E>) -> Self {
        match failure.error {
            TaskError::Cancelled => RunStatus::Cancelled,
            TaskError::TimedOut(_) => RunStatus::TimedOut,
            _ => RunStatus::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Submitted => write!(f, "submitted"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// A record of a status transition with timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: RunStatus,
    pub entered_at: DateTime<Utc>,
}

/// Status of one run plus the history of every status it entered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    run_id: RunId,
    workflow: String,
    status: RunStatus,
    history: Vec<StatusEntry>,
}

impl RunState {
    pub fn new(run_id: RunId, workflow: impl Into<String>) -> Self {
        Self {
            run_id,
            workflow: workflow.into(),
            status: RunStatus::Submitted,
            history: vec![StatusEntry {
                status: RunStatus::Submitted,
                entered_at: Utc::now(),
            }],
        }
    }

    /// Move to `target`, rejecting transitions the status machine forbids.
    pub fn transition(&mut self, target: RunStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidRunTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.history.push(StatusEntry {
            status: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusEntry] {
        &self.history
    }
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    StatusChanged {
        run_id: RunId,
        workflow: String,
        from: RunStatus,
        to: RunStatus,
    },
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct OrchestrationResult<V, E> {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub history: Vec<StatusEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: std::result::Result<V, Failure<E>>,
}

impl<V, E> OrchestrationResult<V, E> {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn value(&self) -> Option<&V> {
        self.outcome.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&Failure<E>> {
        self.outcome.as_ref().err()
    }

    /// The deepest named step that failed, if the run failed.
    pub fn failed_step(&self) -> Option<&str> {
        self.failure().map(|f| f.step.as_str())
    }

    pub fn into_result(self) -> std::result::Result<V, Failure<E>> {
        self.outcome
    }
}

impl<V: Serialize, E: std::fmt::Display> OrchestrationResult<V, E> {
    /// A serializable summary of the run.
    pub fn report(&self) -> RunReport {
        let (output, failed_step, error) = match &self.outcome {
            Ok(value) => (serde_json::to_value(value).ok(), None, None),
            Err(failure) => (
                None,
                Some(failure.step.clone()),
                Some(failure.error.to_string()),
            ),
        };
        RunReport {
            run_id: self.run_id,
            workflow: self.workflow.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            elapsed_ms: self.elapsed.as_millis() as u64,
            output,
            failed_step,
            error,
            history: self.history.clone(),
        }
    }
}

/// JSON-friendly run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub history: Vec<StatusEntry>,
}

/// Runs a workflow on a pool.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(PoolConfig::new(4))?;
/// let orchestrator = Orchestrator::new(pool, OrderWorkflow::new(services));
/// let result = orchestrator.run(request).await;
/// println!("{}", serde_json::to_string_pretty(&result.report())?);
/// ```
pub struct Orchestrator<W: Workflow> {
    pool: WorkerPool,
    workflow: Arc<W>,
    config: OrchestratorConfig,
    event_tx: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl<W: Workflow> Orchestrator<W> {
    pub fn new(pool: WorkerPool, workflow: W) -> Self {
        Self {
            pool,
            workflow: Arc::new(workflow),
            config: OrchestratorConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn run(&self, input: W::Input) -> OrchestrationResult<W::Output, W::Error> {
        self.run_with_cancel(input, CancellationToken::new()).await
    }

    /// Run the workflow; firing `cancel` cancels the whole task graph.
    pub async fn run_with_cancel(
        &self,
        input: W::Input,
        cancel: CancellationToken,
    ) -> OrchestrationResult<W::Output, W::Error> {
        let run_id = RunId::new();
        let name = self.workflow.name().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        let mut state = RunState::new(run_id, name.clone());

        twlog!("run {} ({}): submitted", name, run_id.short());
        let task = self.workflow.build(input);
        let task_id = task.id();

        let remaining = |limit: Duration| limit.saturating_sub(start.elapsed());
        let deadline = async {
            match self.config.deadline {
                Some(limit) => tokio::time::sleep(remaining(limit)).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let timed_out = |limit: Option<Duration>| {
            Failure::new(
                name.clone(),
                task_id,
                TaskError::TimedOut(limit.unwrap_or_default()),
            )
        };

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Failure::new(name.clone(), task_id, TaskError::Cancelled)),
            _ = &mut deadline => Err(timed_out(self.config.deadline)),
            submitted = self.pool.submit(task) => submitted,
        };
        let handle = match submitted {
            Ok(handle) => handle,
            Err(failure) => {
                twlog_error!("run {} ({}): not started: {}", name, run_id.short(), failure.describe());
                self.transition(&mut state, RunStatus::from_failure(&failure));
                return self.finish(state, started_at, start, Err(failure));
            }
        };
        self.transition(&mut state, RunStatus::Running);

        let outcome = tokio::select! {
            outcome = handle.wait() => outcome,
            _ = cancel.cancelled() => {
                twlog_debug!("run {} ({}): cancellation requested", name, run_id.short());
                handle.cancel();
                handle.wait().await
            }
            _ = &mut deadline => {
                twlog_warn!("run {} ({}): deadline expired", name, run_id.short());
                if self.config.cancel_on_deadline {
                    handle.cancel();
                    handle.settled().await;
                }
                Err(timed_out(self.config.deadline))
            }
        };

        let status = match &outcome {
            Ok(_) => RunStatus::Completed,
            Err(failure) => RunStatus::from_failure(failure),
        };
        self.transition(&mut state, status);
        match &outcome {
            Ok(_) => twlog!("run {} ({}): completed", name, run_id.short()),
            Err(failure) => twlog_warn!(
                "run {} ({}): {}: {}",
                name,
                run_id.short(),
                status,
                failure.describe()
            ),
        }
        self.finish(state, started_at, start, outcome)
    }

    fn transition(&self, state: &mut RunState, target: RunStatus) {
        let from = state.status();
        if let Err(e) = state.transition(target) {
            twlog_warn!("run {}: {}", state.run_id().short(), e);
            return;
        }
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(OrchestratorEvent::StatusChanged {
                run_id: state.run_id(),
                workflow: state.workflow().to_string(),
                from,
                to: target,
            });
        }
    }

    fn finish(
        &self,
        state: RunState,
        started_at: DateTime<Utc>,
        start: Instant,
        outcome: std::result::Result<W::Output, Failure<W::Error>>,
    ) -> OrchestrationResult<W::Output, W::Error> {
        OrchestrationResult {
            run_id: state.run_id,
            workflow: state.workflow,
            status: state.status,
            history: state.history,
            started_at,
            finished_at: Utc::now(),
            elapsed: start.elapsed(),
            outcome,
        }
    }
}
