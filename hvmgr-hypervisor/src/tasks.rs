//! Background task handles.
//!
//! Lifecycle operations run as independent tokio tasks so a slow control
//! plane never blocks the caller. Each task completes exactly once through
//! its [`TaskHandle`].

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::error;

use crate::error::{HypervisorError, Result};

/// Handle to a spawned operation with a single completion.
pub struct TaskHandle<T> {
    name: &'static str,
    inner: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn `future` on the current runtime.
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            name,
            inner: tokio::spawn(future),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait for the operation to finish.
    pub async fn wait(self) -> Result<T> {
        match self.inner.await {
            Ok(result) => result,
            Err(e) => {
                error!(task = self.name, error = %e, "Task did not complete");
                Err(HypervisorError::Internal(format!("{} task failed: {}", self.name, e)))
            }
        }
    }

    /// Deliver the result to `callback` once the task finishes.
    ///
    /// The callback runs exactly once, on a runtime worker, so it should only
    /// hand the result over to the caller's own update mechanism.
    pub fn on_complete<C>(self, callback: C)
    where
        C: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move {
            callback(self.wait().await);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_task_result() {
        let handle = TaskHandle::spawn("answer", async { Ok(42) });
        assert_eq!(handle.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_internal_error() {
        let handle: TaskHandle<()> = TaskHandle::spawn("boom", async { panic!("boom") });
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, HypervisorError::Internal(_)));
    }

    #[tokio::test]
    async fn test_callback_fires_once() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        TaskHandle::spawn("cb", async { Ok("done") }).on_complete(move |result| {
            let _ = tx.send(result.unwrap());
        });
        assert_eq!(rx.await.unwrap(), "done");
    }
}
