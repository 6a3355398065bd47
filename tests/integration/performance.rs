//! Wall-clock bounds on parallel execution.
//!
//! These tests verify that:
//! - N tasks on a pool of size M take about ceil(N / M) task durations
//! - A join adds no measurable overhead over its slowest wave
//! - Awaiting with a timeout returns on time without stopping the task
//!
//! Run with `--nocapture` to see the measured timings.

use std::time::{Duration, Instant};

use futures::future::join_all;
use taskweave::core::TaskState;
use taskweave::orchestration::join;
use taskweave::orchestration::simulate::simulated_download;

use crate::fixtures::{pool, sleeper};

const TASK_MS: u64 = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_tasks_on_three_slots_take_two_waves() {
    let pool = pool(3);
    let start = Instant::now();

    let mut handles = Vec::new();
    for i in 0..5 {
        let task = sleeper(&format!("wave-{}", i), Duration::from_millis(TASK_MS), i);
        handles.push(pool.submit(task).await.unwrap());
    }
    for result in join_all(handles.iter().map(|h| h.wait())).await {
        result.unwrap();
    }

    let elapsed = start.elapsed();
    println!("5 x {}ms on 3 slots: {:?}", TASK_MS, elapsed);
    assert!(elapsed >= Duration::from_millis(2 * TASK_MS));
    assert!(
        elapsed < Duration::from_millis(3 * TASK_MS),
        "took {:?}, expected two waves",
        elapsed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_of_downloads_matches_pool_width() {
    let pool = pool(4);
    let downloads = (0..8)
        .map(|i| simulated_download(format!("file-{}", i), Duration::from_millis(TASK_MS)))
        .collect();

    let start = Instant::now();
    let files = pool
        .submit(join("downloads", downloads))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let elapsed = start.elapsed();

    println!("8 downloads on 4 slots: {:?}", elapsed);
    assert_eq!(files.len(), 8);
    assert_eq!(files[0].name, "file-0");
    assert!(elapsed >= Duration::from_millis(2 * TASK_MS));
    assert!(elapsed < Duration::from_millis(3 * TASK_MS), "took {:?}", elapsed);
    assert_eq!(pool.stats().peak_running, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_timeout_returns_early_and_task_keeps_running() {
    let pool = pool(1);
    let handle = pool
        .submit(sleeper("long", Duration::from_millis(500), 8))
        .await
        .unwrap();

    let start = Instant::now();
    let failure = handle
        .wait_timeout(Duration::from_millis(100))
        .await
        .unwrap_err();
    let waited = start.elapsed();

    println!("wait_timeout(100ms) returned after {:?}", waited);
    assert!(failure.is_timeout());
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(150), "waited {:?}", waited);
    assert_eq!(handle.state(), TaskState::Running);

    assert_eq!(handle.wait().await.unwrap(), 8);
    assert_eq!(handle.state(), TaskState::Succeeded);
}
