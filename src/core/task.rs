//! Task data model for the deployment graph.
//!
//! A task is one named opaque command plus the policy that governs how it
//! is retried and how long each attempt may run.

use crate::config::{
    RetryDefaults, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS,
    DEFAULT_TIMEOUT_SECS,
};
use crate::core::command::Command;
use crate::error::{Error, Result};
use crate::util::duration_from_secs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Task status in its lifecycle.
///
/// `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Retry, backoff and timeout settings for one task.
///
/// Total attempts are `max_retries + 1`. The delay before retry `n`
/// (1-based) is `initial_delay * backoff_multiplier^(n-1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_secs_f64(DEFAULT_RETRY_DELAY_SECS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl From<&RetryDefaults> for RetryPolicy {
    fn from(defaults: &RetryDefaults) -> Self {
        Self {
            max_retries: defaults.max_retries,
            initial_delay: duration_from_secs(defaults.retry_delay_secs),
            backoff_multiplier: defaults.backoff_multiplier,
            timeout: duration_from_secs(defaults.timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with the given timeout.
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            timeout,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before the given retry (1 = first retry).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else if secs.is_infinite() {
            Duration::MAX
        } else {
            Duration::ZERO
        }
    }

    pub fn validate(&self, task: &str) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "task {}: backoff_multiplier must be >= 1, got {}",
                task, self.backoff_multiplier
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "task {}: timeout must be > 0",
                task
            )));
        }
        Ok(())
    }
}

/// A single task in the deployment graph.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    /// Logical deployment unit this task belongs to.
    pub component: String,
    pub command: Arc<dyn Command>,
    pub dependencies: Vec<String>,
    pub policy: RetryPolicy,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task. The component defaults to the task name.
    pub fn new(name: &str, command: Arc<dyn Command>) -> Self {
        Self {
            name: name.to_string(),
            component: name.to_string(),
            command,
            dependencies: Vec::new(),
            policy: RetryPolicy::default(),
            status: TaskStatus::Pending,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_component(mut self, component: &str) -> Self {
        self.component = component.to_string();
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn transition(&mut self, to: TaskStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
        );
        if !allowed {
            return Err(Error::InvalidTaskTransition {
                task: self.name.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Pending -> Running, recording the start time.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Succeeded.
    pub fn succeed(&mut self) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Running or Pending -> Failed. Pending covers tasks that never ran.
    pub fn fail(&mut self) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("component", &self.component)
            .field("command", &self.command.describe())
            .field("dependencies", &self.dependencies)
            .field("status", &self.status)
            .finish()
    }
}
