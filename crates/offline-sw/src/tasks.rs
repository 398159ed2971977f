//! Detached background work.
//!
//! Runtime cache stores and `CACHE_URLS` fills run after the caller already
//! has its answer. They are spawned here, their errors are logged, and
//! nothing on the response path ever awaits them. [`DetachedTasks::drain`]
//! exists for shutdown and tests.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::ServiceWorkerError;

/// Tracker for fire-and-forget tasks.
#[derive(Debug, Default)]
pub struct DetachedTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DetachedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task; failures are logged under `label`.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(task = label, error = %e, "Background task failed");
            }
        });

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tasks not yet finished.
    pub fn pending(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every spawned task, including ones spawned while waiting.
    pub async fn drain(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *handles)
            };
            if batch.is_empty() {
                return;
            }
            for result in futures::future::join_all(batch).await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task panicked or was cancelled");
                }
            }
        }
    }
}
