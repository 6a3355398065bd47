//! Join, chain and fallback semantics observed from outside the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskweave::config::PoolConfig;
use taskweave::core::{RetryPolicy, Task, TaskState};
use taskweave::error::TaskError;
use taskweave::orchestration::{chain, fallback, join, join2, try_chain, PoolEvent, WorkerPool};
use tokio::sync::mpsc;

use crate::fixtures::{failing_after, pool, sleeper, CallCounter};

/// A long task that records whether it saw the cancellation signal.
fn observing_sleeper(name: &str, saw_cancel: Arc<AtomicBool>) -> Task<u32, String> {
    Task::new(name, move |ctx| {
        let saw_cancel = Arc::clone(&saw_cancel);
        async move {
            tokio::select! {
                _ = ctx.cancelled() => {
                    saw_cancel.store(true, Ordering::SeqCst);
                    Err("stopped".to_string())
                }
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(0),
            }
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_join_succeeds_immediately() {
    let pool = pool(1);
    let handle = pool
        .submit(join::<u32, String>("nothing", Vec::new()))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), Vec::<u32>::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_keeps_input_order() {
    let pool = pool(4);
    let tasks = vec![
        sleeper("slow", Duration::from_millis(30), 1),
        sleeper("fast", Duration::from_millis(1), 2),
        sleeper("medium", Duration::from_millis(10), 3),
    ];
    let values = pool.submit(join("ordered", tasks)).await.unwrap().wait().await;
    assert_eq!(values.unwrap(), vec![1, 2, 3]);
}

// Single-threaded so that a child's settle, its `Finished` event and its
// slot release all land before the join is polled again.
#[tokio::test]
async fn test_join_failure_cancels_siblings() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = WorkerPool::with_events(PoolConfig::new(4), tx).unwrap();
    let first = Arc::new(AtomicBool::new(false));
    let second = Arc::new(AtomicBool::new(false));

    let tasks = vec![
        observing_sleeper("long-1", Arc::clone(&first)),
        failing_after("broken", Duration::from_millis(20), "disk full"),
        observing_sleeper("long-2", Arc::clone(&second)),
    ];

    let start = Instant::now();
    let failure = pool
        .submit(join("all", tasks))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(failure.step, "broken");
    assert_eq!(failure.error.operation(), Some(&"disk full".to_string()));

    // No sibling is still running once the join has settled.
    assert_eq!(pool.stats().running, 0);
    let mut finished = HashMap::new();
    while let Ok(event) = rx.try_recv() {
        if let PoolEvent::Finished { name, state, .. } = event {
            finished.insert(name, state);
        }
    }
    for sibling in ["long-1", "long-2"] {
        let state = finished.get(sibling).copied();
        assert!(
            matches!(state, Some(TaskState::Cancelled | TaskState::Succeeded)),
            "{} ended as {:?}",
            sibling,
            state
        );
    }
    assert_eq!(finished.get("broken"), Some(&TaskState::Failed));
    assert!(first.load(Ordering::SeqCst));
    assert!(second.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_wider_than_pool() {
    let pool = pool(2);
    let tasks = (0..8)
        .map(|i| sleeper(&format!("item-{}", i), Duration::from_millis(5), i))
        .collect();
    let values = pool.submit(join("wide", tasks)).await.unwrap().wait().await;
    assert_eq!(values.unwrap(), (0..8).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join2_mixes_types() {
    let pool = pool(2);
    let task = join2(
        "pair",
        Task::<String, String>::ready("name", "widget".to_string()),
        Task::<u64, String>::ready("price", 1999),
    );
    let (name, price) = pool.submit(task).await.unwrap().wait().await.unwrap();
    assert_eq!(name, "widget");
    assert_eq!(price, 1999);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chain_feeds_value_forward() {
    let pool = pool(1);
    let task = chain("double", sleeper("base", Duration::from_millis(1), 21), |v| {
        Task::<u32, String>::ready("times-two", v * 2)
    });
    assert_eq!(pool.submit(task).await.unwrap().wait().await.unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chain_never_calls_next_after_failure() {
    let pool = pool(1);
    let built = Arc::new(AtomicUsize::new(0));
    let counter = CallCounter::new();

    let builds = Arc::clone(&built);
    let next_counter = counter.clone();
    let task = chain(
        "guarded",
        failing_after("first", Duration::from_millis(1), "nope"),
        move |v| {
            builds.fetch_add(1, Ordering::SeqCst);
            next_counter.task("second", v)
        },
    );

    let failure = pool.submit(task).await.unwrap().wait().await.unwrap_err();
    assert_eq!(failure.step, "first");
    assert_eq!(built.load(Ordering::SeqCst), 0);
    assert_eq!(counter.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chain_with_retry_reruns_from_first_step() {
    let pool = pool(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = Task::<u32, String>::new("flaky", {
        let calls = Arc::clone(&calls);
        move |_ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("connection reset".to_string())
                } else {
                    Ok(5)
                }
            }
        }
    });
    let task = chain("unit", flaky, |v| Task::ready("square", v * v))
        .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)));

    let handle = pool.submit(task).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), 25);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.state(), TaskState::Succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_try_chain_construction_error() {
    let pool = pool(1);
    let task = try_chain(
        "validate",
        Task::<u32, String>::ready("load", 0),
        |v| {
            if v == 0 {
                Err("zero is not allowed".to_string())
            } else {
                Ok(Task::ready("use", v))
            }
        },
    );
    let failure = pool.submit(task).await.unwrap().wait().await.unwrap_err();
    assert_eq!(failure.step, "validate");
    assert!(matches!(failure.error, TaskError::Operation(ref e) if e == "zero is not allowed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fallback_recovers_from_failure() {
    let pool = pool(1);
    let task = fallback(
        "with-backup",
        failing_after("primary", Duration::from_millis(1), "down"),
        |failure| {
            assert_eq!(failure.step, "primary");
            Task::ready("backup", 7)
        },
    );
    assert_eq!(pool.submit(task).await.unwrap().wait().await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fallback_never_calls_recover_on_success() {
    let pool = pool(1);
    let recovered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&recovered);
    let task = fallback(
        "unused-backup",
        sleeper("primary", Duration::from_millis(1), 3),
        move |_failure| {
            flag.store(true, Ordering::SeqCst);
            Task::ready("backup", 0)
        },
    );
    assert_eq!(pool.submit(task).await.unwrap().wait().await.unwrap(), 3);
    assert!(!recovered.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fallback_can_reraise_original_failure() {
    let pool = pool(1);
    let task = fallback(
        "selective",
        failing_after("primary", Duration::from_millis(1), "fatal"),
        Task::rejected,
    );
    let failure = pool.submit(task).await.unwrap().wait().await.unwrap_err();
    assert_eq!(failure.step, "primary");
    assert_eq!(failure.error.operation(), Some(&"fatal".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelling_a_composite_reaches_its_children() {
    let pool = pool(2);
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let handle = pool
        .submit(join(
            "group",
            vec![observing_sleeper("child", Arc::clone(&saw_cancel))],
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    let failure = handle.wait_timeout(Duration::from_secs(2)).await.unwrap_err();
    assert!(failure.is_cancelled());
    assert!(saw_cancel.load(Ordering::SeqCst));
}
