use std::time::Duration;

use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid run transition from {from} to {to}")]
    InvalidRunTransition { from: String, to: String },

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Step already exists: {0}")]
    StepExists(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a task did not produce a value.
///
/// `E` is the error type of the task's own operation; every other variant
/// is raised by the engine itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
    #[error("operation failed: {0}")]
    Operation(E),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("pool queue is full (capacity: {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("pool is shut down")]
    PoolShutdown,

    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl<E> TaskError<E> {
    /// Errors a retry policy is allowed to act on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Operation(_) | TaskError::TimedOut(_))
    }

    /// Terminal handle state a task settles in when it fails with this error.
    pub fn terminal_state(&self) -> TaskState {
        match self {
            TaskError::Cancelled => TaskState::Cancelled,
            TaskError::TimedOut(_) => TaskState::TimedOut,
            _ => TaskState::Failed,
        }
    }

    /// The operation's own error, if that is what failed.
    pub fn operation(&self) -> Option<&E> {
        match self {
            TaskError::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Text for logs; does not require `E: Display`.
    pub fn describe(&self) -> String {
        match self {
            TaskError::Operation(_) => "operation failed".to_string(),
            TaskError::TimedOut(limit) => format!("timed out after {:?}", limit),
            TaskError::Cancelled => "cancelled".to_string(),
            TaskError::PoolExhausted { capacity } => {
                format!("pool queue is full (capacity: {})", capacity)
            }
            TaskError::PoolShutdown => "pool is shut down".to_string(),
            TaskError::Panicked(message) => format!("operation panicked: {}", message),
        }
    }
}

/// A task failure attributed to the named step that actually failed.
///
/// Combinators pass their children's failures through untouched, so the
/// step recorded here is the deepest one, not the enclosing join or chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("step `{step}` failed: {error}")]
pub struct Failure<E> {
    pub step: String,
    pub task_id: TaskId,
    pub error: TaskError<E>,
}

impl<E> Failure<E> {
    pub fn new(step: impl Into<String>, task_id: TaskId, error: TaskError<E>) -> Self {
        Self {
            step: step.into(),
            task_id,
            error,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, TaskError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, TaskError::TimedOut(_))
    }

    /// Like `Display`, without requiring `E: Display`.
    pub fn describe(&self) -> String {
        format!("step `{}` failed: {}", self.step, self.error.describe())
    }
}
