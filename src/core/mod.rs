//! Core domain models for taskweave.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks and their states, retry policies, and step graphs.

pub mod dag;
pub mod retry;
pub mod task;

pub use dag::{StepBuilder, StepGraph};
pub use retry::{Backoff, RetryPolicy};
pub use task::{Payload, Priority, Task, TaskId, TaskState};
