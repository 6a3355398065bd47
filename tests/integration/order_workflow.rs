//! The order-processing workflow end to end against simulated services.

use std::sync::Arc;
use std::time::{Duration, Instant};

use taskweave::config::PoolConfig;
use taskweave::error::TaskError;
use taskweave::orchestration::simulate::{FailureMode, SimulatedOrderServices, SIMULATED_STOCK};
use taskweave::orchestration::{
    OrderError, OrderWorkflow, Orchestrator, RunStatus, WorkerPool, CHECK_STOCK, FETCH_PRODUCT,
    FETCH_USER, NOTIFY, PAY, PAY_BACKUP,
};
use tokio_util::sync::CancellationToken;

use crate::fixtures::order_request;

fn setup(
    services: SimulatedOrderServices,
) -> (
    Orchestrator<OrderWorkflow<SimulatedOrderServices>>,
    Arc<SimulatedOrderServices>,
) {
    let services = Arc::new(services);
    let pool = WorkerPool::new(PoolConfig::new(3)).unwrap();
    let workflow = OrderWorkflow::from_arc(Arc::clone(&services));
    (Orchestrator::new(pool, workflow), services)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path_calls_every_step_once() {
    let (orchestrator, services) = setup(SimulatedOrderServices::new());
    let result = orchestrator.run(order_request(3)).await;

    assert!(result.is_success());
    assert_eq!(result.workflow, "process-order");
    let confirmation = result.value().unwrap();
    assert_eq!(confirmation.order_id, "order-42");
    assert_eq!(confirmation.user.id, "user-7");
    assert_eq!(confirmation.product.id, "product-3");
    for step in [FETCH_USER, FETCH_PRODUCT, CHECK_STOCK, PAY, NOTIFY] {
        assert_eq!(services.calls(step), 1, "step {}", step);
    }
    assert_eq!(services.calls(PAY_BACKUP), 0);

    let statuses: Vec<RunStatus> = result.history.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![RunStatus::Submitted, RunStatus::Running, RunStatus::Completed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetches_run_concurrently() {
    let (orchestrator, _services) = setup(
        SimulatedOrderServices::new().with_latency(Duration::from_millis(50)),
    );
    let start = Instant::now();
    let result = orchestrator.run(order_request(1)).await;
    let elapsed = start.elapsed();

    assert!(result.is_success());
    // fetch (parallel) + stock + pay + notify = 4 sequential levels.
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(250), "took {:?}", elapsed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_declined_payment_is_attributed_to_pay() {
    let (orchestrator, services) =
        setup(SimulatedOrderServices::new().failing(PAY, FailureMode::Permanent));
    let result = orchestrator.run(order_request(1)).await;

    assert_eq!(result.status, RunStatus::Failed);
    let failure = result.failure().unwrap();
    assert_eq!(failure.step, PAY);
    match &failure.error {
        TaskError::Operation(OrderError::PaymentDeclined(reason)) => {
            assert!(reason.contains("user-7"))
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(services.calls(NOTIFY), 0);
    assert_eq!(services.calls(PAY_BACKUP), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backup_unused_when_primary_succeeds() {
    let services = SimulatedOrderServices::new().failing(PAY_BACKUP, FailureMode::Transient);
    let (orchestrator, services) = setup(services);
    let result = orchestrator.run(order_request(1)).await;

    // Primary succeeds, so the backup is never tried.
    assert!(result.is_success());
    assert_eq!(services.calls(PAY_BACKUP), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_stock() {
    let (orchestrator, services) = setup(SimulatedOrderServices::new());
    let result = orchestrator.run(order_request(SIMULATED_STOCK + 5)).await;

    assert_eq!(result.failed_step(), Some(CHECK_STOCK));
    assert!(matches!(
        result.failure().unwrap().error,
        TaskError::Operation(OrderError::OutOfStock { available, .. }) if available == SIMULATED_STOCK
    ));
    assert_eq!(services.calls(PAY), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_external_cancel_stops_the_run() {
    let (orchestrator, services) = setup(
        SimulatedOrderServices::new().with_latency(Duration::from_millis(100)),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = orchestrator
        .run_with_cancel(order_request(1), cancel)
        .await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.failure().unwrap().is_cancelled());
    assert_eq!(services.calls(CHECK_STOCK), 0);
    assert_eq!(services.calls(NOTIFY), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_report_names_failed_step() {
    let (orchestrator, _services) =
        setup(SimulatedOrderServices::new().failing(NOTIFY, FailureMode::Permanent));
    let result = orchestrator.run(order_request(1)).await;
    let report = serde_json::to_value(result.report()).unwrap();

    assert_eq!(report["status"], "failed");
    assert_eq!(report["failed_step"], NOTIFY);
    assert!(report.get("output").is_none());
    assert!(report["error"].as_str().unwrap().contains("rejected"));
}
