//! Step graphs run through the orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskweave::config::OrchestratorConfig;
use taskweave::core::{StepGraph, Task};
use taskweave::orchestration::{Orchestrator, RunStatus, SchedulerEvent};

use crate::fixtures::pool;

type Graph = StepGraph<u32, String>;

/// A step that sleeps, then yields the sum of its inputs plus `add`.
fn summing_step(
    name: &'static str,
    delay: Duration,
    add: u32,
) -> impl Fn(&HashMap<String, u32>) -> Task<u32, String> + Send + Sync + 'static {
    move |inputs| {
        let total = inputs.values().sum::<u32>() + add;
        Task::new(name, move |_ctx| async move {
            tokio::time::sleep(delay).await;
            Ok(total)
        })
    }
}

/// ```text
///   a
///  / \
/// b   c
///  \ /
///   d
/// ```
fn diamond(delay: Duration) -> Graph {
    let mut graph = Graph::new("diamond");
    graph.add_step("a", summing_step("a", delay, 1)).unwrap();
    graph.add_step("b", summing_step("b", delay, 10)).unwrap();
    graph.add_step("c", summing_step("c", delay, 100)).unwrap();
    graph.add_step("d", summing_step("d", delay, 1000)).unwrap();
    graph.add_dependency("a", "b").unwrap();
    graph.add_dependency("a", "c").unwrap();
    graph.add_dependency("b", "d").unwrap();
    graph.add_dependency("c", "d").unwrap();
    graph
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diamond_passes_outputs_downstream() {
    let orchestrator = Orchestrator::new(pool(2), diamond(Duration::from_millis(5)));
    let result = orchestrator.run(()).await;

    assert!(result.is_success());
    assert_eq!(result.status, RunStatus::Completed);
    let outputs = result.value().unwrap();
    assert_eq!(outputs["a"], 1);
    assert_eq!(outputs["b"], 11);
    assert_eq!(outputs["c"], 101);
    assert_eq!(outputs["d"], 11 + 101 + 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_branches_run_in_parallel() {
    let orchestrator = Orchestrator::new(pool(2), diamond(Duration::from_millis(40)));
    let start = Instant::now();
    let result = orchestrator.run(()).await;
    let elapsed = start.elapsed();

    assert!(result.is_success());
    // Three levels of 40ms; b and c share one.
    assert!(elapsed >= Duration::from_millis(120));
    assert!(elapsed < Duration::from_millis(160), "took {:?}", elapsed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_step_stops_dependents() {
    let ran_d = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran_d);

    let mut graph = Graph::new("broken");
    graph.add_step("a", summing_step("a", Duration::from_millis(1), 1)).unwrap();
    graph
        .add_step("b", |_| Task::fail("b", "bad input".to_string()))
        .unwrap();
    graph
        .add_step("d", move |_| {
            flag.store(true, Ordering::SeqCst);
            Task::ready("d", 0)
        })
        .unwrap();
    graph.add_dependency("a", "b").unwrap();
    graph.add_dependency("b", "d").unwrap();

    let result = Orchestrator::new(pool(2), graph).run(()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_step(), Some("b"));
    assert!(!ran_d.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_step_events_in_dependency_order() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut graph = Graph::new("line");
    graph.add_step("first", summing_step("first", Duration::from_millis(1), 1)).unwrap();
    graph.add_step("second", summing_step("second", Duration::from_millis(1), 1)).unwrap();
    graph.add_dependency("first", "second").unwrap();

    let pool = pool(1);
    let outputs = pool
        .submit(graph.to_task_with_events("line", tx))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outputs["second"], 2);

    let mut completed = Vec::new();
    let mut finished = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SchedulerEvent::StepCompleted { step } => completed.push(step),
            SchedulerEvent::AllStepsComplete => finished = true,
            _ => {}
        }
    }
    assert_eq!(completed, vec!["first".to_string(), "second".to_string()]);
    assert!(finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_cancels_graph() {
    let cancelled = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Graph::new("slow");
    for name in ["left", "right"] {
        let cancelled = Arc::clone(&cancelled);
        graph
            .add_step(name, move |_| {
                let cancelled = Arc::clone(&cancelled);
                Task::new(name, move |ctx| {
                    let cancelled = Arc::clone(&cancelled);
                    async move {
                        tokio::select! {
                            _ = ctx.cancelled() => {
                                cancelled.lock().unwrap().push(name);
                                Err("stopped".to_string())
                            }
                            _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(0),
                        }
                    }
                })
            })
            .unwrap();
    }

    let orchestrator = Orchestrator::new(pool(2), graph)
        .with_config(OrchestratorConfig::with_deadline(Duration::from_millis(50)));
    let start = Instant::now();
    let result = orchestrator.run(()).await;

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(result.status, RunStatus::TimedOut);
    assert_eq!(result.failed_step(), Some("slow"));
    let mut cancelled = cancelled.lock().unwrap().clone();
    cancelled.sort();
    assert_eq!(cancelled, vec!["left", "right"]);
}
