//! Bounded pool of task workers.
//!
//! Each worker is a spawned tokio task that runs one command through the
//! [`RetryExecutor`] and reports back on the pool's completion channel. The
//! pool only enforces capacity and tracks what is in flight; deciding what
//! to run is the scheduler's job.

use crate::core::command::Command;
use crate::core::task::RetryPolicy;
use crate::error::{Error, Result};
use crate::flog_debug;
use crate::orchestration::executor::{ExecutionResult, FailureKind, RetryExecutor};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Message sent by a worker when its task is finished.
#[derive(Debug, Clone)]
pub struct WorkerCompletion {
    pub task: String,
    pub result: ExecutionResult,
}

/// Manages a bounded set of concurrently running workers.
///
/// # Example
///
/// ```ignore
/// let mut pool = WorkerPool::new(2, RetryExecutor::new());
/// pool.spawn("setup", command, RetryPolicy::default())?;
/// let done = pool.next_completion().await;
/// ```
pub struct WorkerPool {
    max_workers: usize,
    executor: RetryExecutor,
    running: HashMap<String, AbortHandle>,
    completion_tx: mpsc::UnboundedSender<WorkerCompletion>,
    completion_rx: mpsc::UnboundedReceiver<WorkerCompletion>,
}

impl WorkerPool {
    /// Create a pool. A capacity of zero is raised to one.
    pub fn new(max_workers: usize, executor: RetryExecutor) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            max_workers: max_workers.max(1),
            executor,
            running: HashMap::new(),
            completion_tx,
            completion_rx,
        }
    }

    /// Start a worker for `task`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerPoolFull`] when every slot is taken.
    pub fn spawn(
        &mut self,
        task: &str,
        command: Arc<dyn Command>,
        policy: RetryPolicy,
    ) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_workers,
            });
        }

        let name = task.to_string();
        let executor = self.executor.clone();
        let tx = self.completion_tx.clone();

        let handle = tokio::spawn(async move {
            let run = executor.execute(command.as_ref(), &policy, &name);
            let result = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    let mut result =
                        ExecutionResult::not_run(&name, FailureKind::Execution, "worker panicked");
                    result.attempts = 1;
                    result
                }
            };
            let _ = tx.send(WorkerCompletion { task: name, result });
        });

        self.running.insert(task.to_string(), handle.abort_handle());
        flog_debug!(
            "Worker started for {} ({}/{} busy)",
            task,
            self.running.len(),
            self.max_workers
        );
        Ok(())
    }

    /// Wait for the next worker to finish and free its slot.
    ///
    /// Returns `None` only if no worker is running.
    pub async fn next_completion(&mut self) -> Option<WorkerCompletion> {
        if self.running.is_empty() {
            return None;
        }
        let completion = self.completion_rx.recv().await?;
        self.running.remove(&completion.task);
        Some(completion)
    }

    pub fn is_running(&self, task: &str) -> bool {
        self.running.contains_key(task)
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_workers
    }

    pub fn free_slots(&self) -> usize {
        self.max_workers.saturating_sub(self.active_count())
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Abort every running worker. Their commands are dropped mid-flight.
    pub fn abort_all(&mut self) {
        for (task, handle) in self.running.drain() {
            flog_debug!("Aborting worker for {}", task);
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.abort_all();
    }
}
