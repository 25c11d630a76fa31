//! Supervised background tasks.
//!
//! A [`SupervisedTask`] wraps a long-lived future so that failures are never
//! silent: any error outcome other than cancellation is logged at error
//! severity when the body exits. [`stop`](SupervisedTask::stop) cancels the
//! task and then waits without a timeout; cancellation is the expected
//! outcome and is swallowed, anything else surfaces to the caller.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct SupervisedTask {
    name: String,
    handle: Option<JoinHandle<Result<()>>>,
}

impl SupervisedTask {
    /// Schedule `body` for independent execution.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = body.await;
            if let Err(e) = &result {
                error!(task = %task_name, error = %e, "unhandled error in task body");
            }
            result
        });
        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Request cancellation, then wait for the task to finish.
    ///
    /// Returns the body's own error if it failed before the cancellation
    /// landed, or a task error if the body panicked.
    pub async fn stop(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.abort();
        match handle.await {
            Ok(result) => {
                debug!(task = %self.name, "task stopped");
                result
            }
            Err(e) if e.is_cancelled() => {
                debug!(task = %self.name, "task cancelled");
                Ok(())
            }
            Err(e) => Err(Error::Task {
                name: self.name.clone(),
                message: e.to_string(),
            }),
        }
    }
}

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stop_swallows_cancellation() {
        let task = SupervisedTask::spawn("sleeper", async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        });
        task.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_surfaces_body_error() {
        let task = SupervisedTask::spawn("failing", async {
            Err(Error::Config {
                message: "expected failure".to_string(),
            })
        });
        // Let the body run to completion before stopping.
        tokio::task::yield_now().await;
        let err = task.stop().await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_completed_task_stops_cleanly() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = SupervisedTask::spawn("oneshot", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        tokio::task::yield_now().await;
        task.stop().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
