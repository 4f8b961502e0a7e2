//! Dependency-aware parallel scheduler.
//!
//! The scheduler validates the task graph, then repeatedly dispatches every
//! eligible task (all dependencies Succeeded) in insertion order up to the
//! pool's free capacity and blocks until a worker reports back. Tasks whose
//! dependencies failed are failed without running, transitively, so the
//! loop always terminates.

use crate::core::command::Command;
use crate::core::dag::DependencyGraph;
use crate::core::task::{RetryPolicy, Task, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::executor::{ExecutionResult, FailureKind, RetryExecutor};
use crate::orchestration::pool::{WorkerCompletion, WorkerPool};
use crate::util::default_parallelism;
use crate::{flog, flog_debug, flog_warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Counts emitted after each task completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} completed, {} running, {} pending, {} failed",
            self.completed, self.running, self.pending, self.failed
        )
    }
}

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A task was handed to a worker.
    TaskStarted { task: String, component: String },
    /// A task finished successfully.
    TaskSucceeded {
        task: String,
        component: String,
        attempts: u32,
    },
    /// A task ran and exhausted its attempts.
    TaskFailed {
        task: String,
        component: String,
        error: String,
        failure: FailureKind,
    },
    /// A task was failed without running.
    TaskSkipped {
        task: String,
        component: String,
        reason: String,
        failure: FailureKind,
    },
    Progress(ProgressSnapshot),
    /// Dispatching stopped because of a global timeout or an external cancel.
    Cancelled { reason: String },
    /// Nothing is pending or running any more.
    AllTasksComplete,
}

/// Knobs for a single scheduling run.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Concurrent task limit. Defaults to the number of CPU cores.
    pub max_parallel: Option<usize>,
    /// Wall-clock budget after which pending tasks are cancelled.
    pub global_timeout: Option<Duration>,
    pub events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    pub cancel: Option<CancellationToken>,
}

impl ScheduleOptions {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Result of a scheduling run, one entry per task in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub results: Vec<ExecutionResult>,
    pub overall_success: bool,
    pub cancelled: bool,
    pub elapsed_seconds: f64,
}

impl ScheduleReport {
    pub fn get(&self, task: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.task_name == task)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.succeeded)
    }
}

/// Shared, read-only view of task statuses while a run is in progress.
pub type StatusMap = Arc<RwLock<HashMap<String, TaskStatus>>>;

/// Runs a set of named tasks respecting their dependencies.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = Scheduler::new();
/// scheduler.add_task("setup", shell("kind create cluster"), &[], RetryPolicy::default())?;
/// scheduler.add_task("deploy", shell("helm install lab ./chart"), &["setup"], RetryPolicy::default())?;
/// let report = scheduler.execute_all(Some(2)).await?;
/// ```
pub struct Scheduler {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    statuses: StatusMap,
    executor: RetryExecutor,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_executor(RetryExecutor::new())
    }

    pub fn with_executor(executor: RetryExecutor) -> Self {
        Self {
            tasks: Vec::new(),
            index: HashMap::new(),
            statuses: Arc::new(RwLock::new(HashMap::new())),
            executor,
        }
    }

    /// Register a task whose component is its own name.
    pub fn add_task(
        &mut self,
        name: &str,
        command: Arc<dyn Command>,
        dependencies: &[&str],
        policy: RetryPolicy,
    ) -> Result<()> {
        self.add(
            Task::new(name, command)
                .with_dependencies(dependencies.iter().copied())
                .with_policy(policy),
        )
    }

    /// Register a task that belongs to `component`.
    pub fn add_task_in(
        &mut self,
        component: &str,
        name: &str,
        command: Arc<dyn Command>,
        dependencies: &[&str],
        policy: RetryPolicy,
    ) -> Result<()> {
        self.add(
            Task::new(name, command)
                .with_component(component)
                .with_dependencies(dependencies.iter().copied())
                .with_policy(policy),
        )
    }

    /// Register a fully built task.
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.name) {
            return Err(Error::DuplicateTaskName(task.name));
        }
        task.policy.validate(&task.name)?;
        flog_debug!(
            "Registered task {} (component {}, deps {:?})",
            task.name,
            task.component,
            task.dependencies
        );
        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Handle on the live status map, for observers.
    pub fn statuses(&self) -> StatusMap {
        Arc::clone(&self.statuses)
    }

    pub async fn status(&self, name: &str) -> Option<TaskStatus> {
        self.statuses.read().await.get(name).copied()
    }

    /// Check for unknown dependencies, then for cycles.
    pub fn validate(&self) -> Result<DependencyGraph> {
        let graph = DependencyGraph::from_entries(
            self.tasks
                .iter()
                .map(|t| (t.name.as_str(), t.dependencies.as_slice())),
        )?;
        graph.validate_acyclic()?;
        Ok(graph)
    }

    pub async fn execute_all(&mut self, max_parallel: Option<usize>) -> Result<ScheduleReport> {
        self.execute_with(ScheduleOptions {
            max_parallel,
            ..Default::default()
        })
        .await
    }

    /// Run every task to a terminal state.
    ///
    /// Configuration problems are returned as errors before anything runs.
    /// Task failures are not errors; they are in the report.
    pub async fn execute_with(&mut self, options: ScheduleOptions) -> Result<ScheduleReport> {
        let graph = self.validate()?;
        if let Some(task) = self.tasks.iter().find(|t| t.status != TaskStatus::Pending) {
            return Err(Error::InvalidTaskTransition {
                task: task.name.clone(),
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }

        let max_parallel = options
            .max_parallel
            .unwrap_or_else(default_parallelism)
            .max(1);
        let events = options.events;
        let external = options.cancel;
        let token = external
            .as_ref()
            .map(|t| t.child_token())
            .unwrap_or_default();
        let timer = options.global_timeout.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                flog_warn!("Global timeout of {:?} reached", limit);
                token.cancel();
            })
        });

        {
            let mut statuses = self.statuses.write().await;
            statuses.clear();
            for task in &self.tasks {
                statuses.insert(task.name.clone(), TaskStatus::Pending);
            }
        }

        flog!(
            "Scheduling {} task(s) with max_parallel={}",
            self.tasks.len(),
            max_parallel
        );

        let clock = Instant::now();
        let mut pool = WorkerPool::new(max_parallel, self.executor.clone());
        let mut results: HashMap<String, ExecutionResult> = HashMap::new();
        let mut cancelled = false;

        loop {
            if !cancelled && token.is_cancelled() {
                cancelled = true;
                let reason = if external.as_ref().is_some_and(|t| t.is_cancelled()) {
                    "run cancelled".to_string()
                } else {
                    "global timeout reached".to_string()
                };
                flog_warn!("Cancelling pending tasks: {}", reason);
                emit(&events, SchedulerEvent::Cancelled {
                    reason: reason.clone(),
                });
                self.fail_pending(&reason, FailureKind::Cancelled, &mut results, &events)
                    .await;
            }

            self.propagate_failures(&graph, &mut results, &events).await;

            if !cancelled {
                self.dispatch_ready(&mut pool, &events).await?;
            }

            if pool.active_count() == 0 {
                let pending = self
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .count();
                if pending > 0 {
                    flog_warn!("{} task(s) left pending with nothing running", pending);
                }
                break;
            }

            tokio::select! {
                completion = pool.next_completion() => {
                    match completion {
                        Some(done) => self.handle_completion(done, &pool, &mut results, &events).await?,
                        None => break,
                    }
                }
                _ = token.cancelled(), if !cancelled => {}
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        emit(&events, SchedulerEvent::AllTasksComplete);

        let ordered: Vec<ExecutionResult> = self
            .tasks
            .iter()
            .map(|t| {
                results.remove(&t.name).unwrap_or_else(|| {
                    ExecutionResult::not_run(&t.name, FailureKind::Cancelled, "never scheduled")
                })
            })
            .collect();
        let overall_success = ordered.iter().all(|r| r.succeeded);
        let elapsed_seconds = clock.elapsed().as_secs_f64();

        flog!(
            "Scheduling finished in {:.1}s: {} succeeded, {} failed{}",
            elapsed_seconds,
            ordered.iter().filter(|r| r.succeeded).count(),
            ordered.iter().filter(|r| !r.succeeded).count(),
            if cancelled { " (cancelled)" } else { "" }
        );

        Ok(ScheduleReport {
            results: ordered,
            overall_success,
            cancelled,
            elapsed_seconds,
        })
    }

    fn is_ready(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task.dependencies.iter().all(|dep| {
                self.get(dep)
                    .map(|d| d.status == TaskStatus::Succeeded)
                    .unwrap_or(false)
            })
    }

    async fn set_status(&self, name: &str, status: TaskStatus) {
        self.statuses.write().await.insert(name.to_string(), status);
    }

    async fn dispatch_ready(
        &mut self,
        pool: &mut WorkerPool,
        events: &Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Result<usize> {
        let ready: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.is_ready(&self.tasks[i]))
            .take(pool.free_slots())
            .collect();

        for &i in &ready {
            let task = &mut self.tasks[i];
            task.start()?;
            pool.spawn(&task.name, Arc::clone(&task.command), task.policy.clone())?;
            flog!("Task {} started", task.name);
            let (name, component) = (task.name.clone(), task.component.clone());
            self.set_status(&name, TaskStatus::Running).await;
            emit(events, SchedulerEvent::TaskStarted {
                task: name,
                component,
            });
        }

        Ok(ready.len())
    }

    async fn handle_completion(
        &mut self,
        done: WorkerCompletion,
        pool: &WorkerPool,
        results: &mut HashMap<String, ExecutionResult>,
        events: &Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Result<()> {
        let i = *self
            .index
            .get(&done.task)
            .ok_or_else(|| Error::TaskNotFound(done.task.clone()))?;
        let task = &mut self.tasks[i];
        let (name, component) = (task.name.clone(), task.component.clone());

        if done.result.succeeded {
            task.succeed()?;
            flog!(
                "Task {} succeeded after {} attempt(s)",
                name,
                done.result.attempts
            );
            self.set_status(&name, TaskStatus::Succeeded).await;
            emit(events, SchedulerEvent::TaskSucceeded {
                task: name.clone(),
                component,
                attempts: done.result.attempts,
            });
        } else {
            task.fail()?;
            let error = done.result.error.clone().unwrap_or_default();
            let failure = done.result.failure.unwrap_or(FailureKind::Execution);
            self.set_status(&name, TaskStatus::Failed).await;
            emit(events, SchedulerEvent::TaskFailed {
                task: name.clone(),
                component,
                error,
                failure,
            });
        }
        results.insert(name, done.result);

        let progress = self.progress(pool);
        flog!("Progress: {}", progress);
        emit(events, SchedulerEvent::Progress(progress));
        Ok(())
    }

    /// Fail every Pending task with a Failed dependency until nothing changes.
    async fn propagate_failures(
        &mut self,
        graph: &DependencyGraph,
        results: &mut HashMap<String, ExecutionResult>,
        events: &Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) {
        loop {
            let doomed: Vec<(usize, String)> = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Pending)
                .filter_map(|(i, t)| {
                    graph
                        .dependencies(&t.name)
                        .into_iter()
                        .find(|dep| {
                            self.get(dep)
                                .map(|d| d.status == TaskStatus::Failed)
                                .unwrap_or(false)
                        })
                        .map(|dep| (i, dep.to_string()))
                })
                .collect();

            if doomed.is_empty() {
                return;
            }

            for (i, dep) in doomed {
                let reason = format!("dependency {} failed", dep);
                self.fail_unrun(i, &reason, FailureKind::DependencyFailed, results, events)
                    .await;
            }
        }
    }

    async fn fail_pending(
        &mut self,
        reason: &str,
        failure: FailureKind,
        results: &mut HashMap<String, ExecutionResult>,
        events: &Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) {
        let pending: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.tasks[i].status == TaskStatus::Pending)
            .collect();
        for i in pending {
            self.fail_unrun(i, reason, failure, results, events).await;
        }
    }

    async fn fail_unrun(
        &mut self,
        i: usize,
        reason: &str,
        failure: FailureKind,
        results: &mut HashMap<String, ExecutionResult>,
        events: &Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) {
        let task = &mut self.tasks[i];
        if task.fail().is_err() {
            return;
        }
        let (name, component) = (task.name.clone(), task.component.clone());
        flog_warn!("Task {} not run: {}", name, reason);
        self.set_status(&name, TaskStatus::Failed).await;
        results.insert(
            name.clone(),
            ExecutionResult::not_run(&name, failure, reason),
        );
        emit(events, SchedulerEvent::TaskSkipped {
            task: name,
            component,
            reason: reason.to_string(),
            failure,
        });
    }

    fn progress(&self, pool: &WorkerPool) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot {
            running: pool.active_count(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Succeeded => snapshot.completed += 1,
                TaskStatus::Failed => snapshot.failed += 1,
                TaskStatus::Pending => snapshot.pending += 1,
                TaskStatus::Running => {}
            }
        }
        snapshot
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<SchedulerEvent>>, event: SchedulerEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
