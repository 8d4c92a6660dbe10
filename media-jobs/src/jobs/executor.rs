//! Bounded executor for blocking work.
//!
//! Work never runs on an async worker task. Each attempt is handed to
//! `spawn_blocking`, gated by a semaphore so the number of concurrently
//! executing work items is capped independently of the worker count.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::job::{Work, WorkArgs};
use crate::error::WorkError;

/// Executor that runs [`Work`] on tokio's blocking thread pool.
#[derive(Debug, Clone)]
pub struct BlockingExecutor {
    permits: Arc<Semaphore>,
    max_threads: usize,
}

impl BlockingExecutor {
    pub fn new(max_threads: usize) -> Self {
        let max_threads = max_threads.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_threads)),
            max_threads,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Number of work items currently executing.
    pub fn busy(&self) -> usize {
        self.max_threads - self.permits.available_permits()
    }

    /// Run one attempt of `work` on the blocking pool.
    ///
    /// The permit travels with the blocking closure, so an attempt abandoned
    /// by a timeout keeps its slot until the underlying thread returns.
    /// Dropping the returned future cancels the token handed to
    /// [`Work::execute_with_cancel`].
    pub async fn run(&self, work: Arc<dyn Work>, args: Arc<WorkArgs>) -> Result<Value, WorkError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkError::new("Executor is closed"))?;

        let cancel = CancellationToken::new();
        let _abandon = cancel.clone().drop_guard();

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work.execute_with_cancel(&args, &cancel)
        });

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(panic = %message, "Work panicked");
                Err(WorkError::new(format!("Work panicked: {message}")))
            }
            Err(e) => Err(WorkError::new(format!("Work task failed: {e}"))),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
