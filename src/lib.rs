//! taskweave: dependent asynchronous task orchestration with bounded
//! concurrency.
//!
//! Leaf tasks run on a [`WorkerPool`](orchestration::WorkerPool) that never
//! has more than `max_concurrency` of them executing at once. Combinators
//! ([`join`](orchestration::join), [`chain`](orchestration::chain),
//! [`fallback`](orchestration::fallback)) and
//! [`StepGraph`](core::StepGraph)s compose them into workflows, which an
//! [`Orchestrator`](orchestration::Orchestrator) runs to a structured
//! result naming the step that failed.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, Failure, Result, TaskError};
