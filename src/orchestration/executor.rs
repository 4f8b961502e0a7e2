//! Retry and timeout wrapper around a single command.
//!
//! Every attempt runs under its own deadline. A failed attempt is retried
//! after an exponentially growing delay until the policy's retry budget is
//! spent. The executor never returns an error: the outcome, including how
//! many attempts were made, is always an [`ExecutionResult`].

use crate::core::command::Command;
use crate::core::task::RetryPolicy;
use crate::{flog, flog_error, flog_trace, flog_warn};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a task did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The command ran and reported failure.
    Execution,
    /// The last attempt exceeded its deadline.
    Timeout,
    /// A dependency failed, so the command was never run.
    DependencyFailed,
    /// The run was cancelled before the task was dispatched.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Execution => write!(f, "execution"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::DependencyFailed => write!(f, "dependency_failed"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of running one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_name: String,
    pub succeeded: bool,
    pub attempts: u32,
    pub elapsed_seconds: f64,
    /// Output of the last attempt.
    pub output: String,
    /// Error text of the last attempt.
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    /// A task that was failed without ever running.
    pub fn not_run(task_name: &str, failure: FailureKind, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.to_string(),
            succeeded: false,
            attempts: 0,
            elapsed_seconds: 0.0,
            output: String::new(),
            error: Some(reason.into()),
            failure: Some(failure),
            started_at: None,
            ended_at: Some(now),
        }
    }

    pub fn was_executed(&self) -> bool {
        self.attempts > 0
    }
}

/// Injectable delay between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Real wall-clock sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Runs commands under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    /// Run `command` until it succeeds or `policy` gives up.
    pub async fn execute(
        &self,
        command: &dyn Command,
        policy: &RetryPolicy,
        label: &str,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let max_attempts = policy.max_attempts();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            flog!(
                "[{}] attempt {}/{} started (elapsed {:.1}s)",
                label,
                attempt,
                max_attempts,
                clock.elapsed().as_secs_f64()
            );

            let attempt_clock = Instant::now();
            let outcome = tokio::time::timeout(policy.timeout, command.invoke()).await;
            let attempt_secs = attempt_clock.elapsed().as_secs_f64();

            let (error, kind, output) = match outcome {
                Ok(Ok(output)) => {
                    flog!(
                        "[{}] attempt {}/{} succeeded in {:.1}s",
                        label,
                        attempt,
                        max_attempts,
                        attempt_secs
                    );
                    let text = output.combined();
                    if !text.is_empty() {
                        flog_trace!("[{}] output:\n{}", label, text);
                    }
                    return ExecutionResult {
                        task_name: label.to_string(),
                        succeeded: true,
                        attempts: attempt,
                        elapsed_seconds: clock.elapsed().as_secs_f64(),
                        output: text,
                        error: None,
                        failure: None,
                        started_at: Some(started_at),
                        ended_at: Some(Utc::now()),
                    };
                }
                Ok(Err(err)) => {
                    flog_warn!(
                        "[{}] attempt {}/{} failed after {:.1}s: {}",
                        label,
                        attempt,
                        max_attempts,
                        attempt_secs,
                        err
                    );
                    let output = err.output.combined();
                    (err.to_string(), FailureKind::Execution, output)
                }
                Err(_) => {
                    flog_warn!(
                        "[{}] attempt {}/{} timed out after {:.1}s (limit {:?})",
                        label,
                        attempt,
                        max_attempts,
                        attempt_secs,
                        policy.timeout
                    );
                    (
                        format!("timed out after {:?}", policy.timeout),
                        FailureKind::Timeout,
                        String::new(),
                    )
                }
            };

            if attempt >= max_attempts {
                flog_error!(
                    "[{}] failed after {} attempt(s) in {:.1}s: {}",
                    label,
                    attempt,
                    clock.elapsed().as_secs_f64(),
                    error
                );
                return ExecutionResult {
                    task_name: label.to_string(),
                    succeeded: false,
                    attempts: attempt,
                    elapsed_seconds: clock.elapsed().as_secs_f64(),
                    output,
                    error: Some(error),
                    failure: Some(kind),
                    started_at: Some(started_at),
                    ended_at: Some(Utc::now()),
                };
            }

            let delay = policy.delay_before_retry(attempt);
            flog!("[{}] retrying in {:.1}s", label, delay.as_secs_f64());
            self.sleeper.sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor").finish_non_exhaustive()
    }
}
