//! Orchestration layer for taskweave.
//!
//! This module provides the bounded worker pool that executes tasks, the
//! handles callers await, the combinators that compose tasks into graphs,
//! the step-graph scheduler, and the orchestrator that runs whole workflows.

mod combinators;
mod context;
mod handle;
mod order;
mod orchestrator;
mod pool;
mod scheduler;
pub mod simulate;

pub use combinators::{chain, fallback, join, join2, try_chain};
pub use context::TaskContext;
pub use handle::TaskHandle;
pub use order::{
    OrderConfirmation, OrderError, OrderRequest, OrderServices, OrderWorkflow, PaymentReceipt,
    Product, StockReservation, User, CHECK_STOCK, FETCH_PRODUCT, FETCH_USER, NOTIFY, PAY,
    PAY_BACKUP,
};
pub use orchestrator::{
    OrchestrationResult, Orchestrator, OrchestratorEvent, RunId, RunReport, RunState, RunStatus,
    StatusEntry, Workflow,
};
pub use pool::{PoolEvent, PoolStats, WorkerPool};
pub use scheduler::SchedulerEvent;
