//! Shared utility functions.

use std::any::Any;

use tokio::task::spawn_blocking;

/// Run `f` on tokio's blocking pool.
///
/// A panic inside `f` is resumed on the awaiting task, so callers that
/// guard against panics (the worker pool does) see it like any other.
pub async fn blocking<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match spawn_blocking(f).await {
        Ok(value) => value,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => std::panic::panic_any(format!("blocking task did not complete: {}", e)),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
