//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building pools with a given concurrency limit
//! - Tasks that record how many of them overlap
//! - Tasks that count their invocations

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskweave::config::PoolConfig;
use taskweave::core::Task;
use taskweave::orchestration::{OrderRequest, WorkerPool};

/// Create a pool allowing `max` concurrent leaf tasks and an unbounded queue.
pub fn pool(max: usize) -> WorkerPool {
    WorkerPool::new(PoolConfig::new(max)).expect("valid pool config")
}

/// Create a pool with a bounded queue.
pub fn bounded_pool(max: usize, queue_capacity: usize) -> WorkerPool {
    WorkerPool::new(PoolConfig::new(max).with_queue_capacity(queue_capacity))
        .expect("valid pool config")
}

/// Tracks the number of tasks inside their operation at once.
#[derive(Debug, Default, Clone)]
pub struct OverlapTracker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl OverlapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest overlap observed so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// A task that sleeps for `duration` while registered with the tracker.
    pub fn task(&self, name: &str, duration: Duration, value: u32) -> Task<u32, String> {
        let tracker = self.clone();
        Task::new(name, move |_ctx| {
            let tracker = tracker.clone();
            async move {
                tracker.enter();
                tokio::time::sleep(duration).await;
                tracker.leave();
                Ok(value)
            }
        })
    }

    /// Like [`task`](Self::task), but holding a blocking-pool thread.
    pub fn blocking_task(&self, name: &str, duration: Duration, value: u32) -> Task<u32, String> {
        let tracker = self.clone();
        Task::blocking(name, move || {
            tracker.enter();
            std::thread::sleep(duration);
            tracker.leave();
            Ok(value)
        })
    }
}

/// Counts invocations of the tasks it creates.
#[derive(Debug, Default, Clone)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A task that counts itself and succeeds with `value`.
    pub fn task(&self, name: &str, value: u32) -> Task<u32, String> {
        let calls = Arc::clone(&self.calls);
        Task::new(name, move |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(value) }
        })
    }
}

/// A task that sleeps for `duration`, then succeeds with `value`.
pub fn sleeper(name: &str, duration: Duration, value: u32) -> Task<u32, String> {
    Task::new(name, move |_ctx| async move {
        tokio::time::sleep(duration).await;
        Ok(value)
    })
}

/// A task that sleeps until done or cancelled, failing when cancelled.
pub fn cancellable_sleeper(name: &str, duration: Duration, value: u32) -> Task<u32, String> {
    Task::new(name, move |ctx| async move {
        tokio::select! {
            _ = ctx.cancelled() => Err("cancelled".to_string()),
            _ = tokio::time::sleep(duration) => Ok(value),
        }
    })
}

/// A task that fails with `error` after `delay`.
pub fn failing_after(name: &str, delay: Duration, error: &str) -> Task<u32, String> {
    let error = error.to_string();
    Task::new(name, move |_ctx| {
        let error = error.clone();
        async move {
            tokio::time::sleep(delay).await;
            Err(error)
        }
    })
}

/// A standard order request.
pub fn order_request(quantity: u32) -> OrderRequest {
    OrderRequest {
        order_id: "order-42".to_string(),
        user_id: "user-7".to_string(),
        product_id: "product-3".to_string(),
        quantity,
    }
}
