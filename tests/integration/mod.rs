//! Integration test suite for taskweave.
//!
//! These tests drive the public API end to end: a real multi-threaded
//! runtime, real timers, and simulated services standing in for I/O.
//!
//! # Test Categories
//!
//! - `pool_limits`: concurrency bound, queue capacity, priority, shutdown
//! - `handles`: awaiting, cancelling and timing out individual tasks
//! - `combinators`: join, chain and fallback semantics
//! - `graph_execution`: step graphs run through the orchestrator
//! - `order_workflow`: the order-processing workflow and failure attribution
//! - `performance`: wall-clock bounds on parallel execution
//!
//! Use `cargo test --test integration performance -- --nocapture` to see timings.

mod fixtures;

mod combinators;
mod graph_execution;
mod order_workflow;
mod performance;
