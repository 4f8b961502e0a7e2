//! Top-level deployment run.
//!
//! The orchestrator turns task specs into a scheduler run and, in parallel,
//! consumes the scheduler's events to drive the component tracker, record
//! created resources and trigger rollbacks as soon as a failed component has
//! nothing left in flight.

use crate::config::{Config, RollbackMode};
use crate::core::command::Command;
use crate::core::component::{ComponentStatus, ComponentStatusReport, ComponentTracker};
use crate::core::resource::ResourceKind;
use crate::core::task::{RetryPolicy, Task};
use crate::error::{Error, Result};
use crate::orchestration::executor::RetryExecutor;
use crate::orchestration::rollback::{ComponentRollback, RollbackEngine, RollbackReport};
use crate::orchestration::scheduler::{ScheduleOptions, ScheduleReport, Scheduler, SchedulerEvent};
use crate::{flog, flog_debug, flog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Declarative description of one task, resolved against config defaults
/// when the run starts.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub command: Arc<dyn Command>,
    pub dependencies: Vec<String>,
    pub component: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
    pub timeout: Option<Duration>,
    /// Resources this task creates, tracked once it succeeds.
    pub resources: Vec<(ResourceKind, String)>,
}

impl TaskSpec {
    pub fn new(name: &str, command: Arc<dyn Command>) -> Self {
        Self {
            name: name.to_string(),
            command,
            dependencies: Vec::new(),
            component: None,
            max_retries: None,
            retry_delay: None,
            backoff_multiplier: None,
            timeout: None,
            resources: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn component(mut self, component: &str) -> Self {
        self.component = Some(component.to_string());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn resource(mut self, kind: ResourceKind, identifier: &str) -> Self {
        self.resources.push((kind, identifier.to_string()));
        self
    }

    pub fn component_name(&self) -> &str {
        self.component.as_deref().unwrap_or(&self.name)
    }

    /// Retry policy with this task's overrides applied over `config`.
    pub fn policy(&self, config: &Config) -> RetryPolicy {
        let mut policy = RetryPolicy::from(&config.defaults);
        if let Some(n) = self.max_retries {
            policy.max_retries = n;
        }
        if let Some(d) = self.retry_delay {
            policy.initial_delay = d;
        }
        if let Some(m) = self.backoff_multiplier {
            policy.backoff_multiplier = m;
        }
        if let Some(t) = self.timeout {
            policy.timeout = t;
        }
        policy
    }

    fn to_task(&self, config: &Config) -> Task {
        Task::new(&self.name, Arc::clone(&self.command))
            .with_component(self.component_name())
            .with_dependencies(self.dependencies.iter().cloned())
            .with_policy(self.policy(config))
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("component", &self.component_name())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Per-run overrides of the configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_parallel: Option<usize>,
    pub global_timeout: Option<Duration>,
    pub rollback_mode: Option<RollbackMode>,
    pub cancel: Option<CancellationToken>,
    /// Receives a copy of every scheduler event.
    pub observer: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub schedule: ScheduleReport,
    pub components: ComponentStatusReport,
    /// Rollbacks of individual failed components during the run.
    pub component_rollbacks: Vec<ComponentRollback>,
    /// Full system rollback, if one ran.
    pub rollback: Option<RollbackReport>,
    pub overall_success: bool,
    pub cancelled: bool,
}

impl RunReport {
    pub fn rolled_back_components(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .component_rollbacks
            .iter()
            .map(|c| c.component.as_str())
            .collect();
        if let Some(rollback) = &self.rollback {
            for name in rollback.rolled_back() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Owns the task specs, component tracker and rollback engine for a run.
pub struct Orchestrator {
    config: Config,
    specs: Vec<TaskSpec>,
    tracker: ComponentTracker,
    engine: Arc<RollbackEngine>,
    executor: RetryExecutor,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(RollbackEngine::new(config.rollback_timeout()));
        Self {
            config,
            specs: Vec::new(),
            tracker: ComponentTracker::new(),
            engine,
            executor: RetryExecutor::new(),
        }
    }

    pub fn with_engine(mut self, engine: RollbackEngine) -> Self {
        self.engine = Arc::new(engine);
        self
    }

    /// Executor used for task attempts.
    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn add_task(&mut self, spec: TaskSpec) -> Result<()> {
        self.config.validate()?;
        if self.specs.iter().any(|s| s.name == spec.name) {
            return Err(Error::DuplicateTaskName(spec.name));
        }
        spec.policy(&self.config).validate(&spec.name)?;
        self.specs.push(spec);
        Ok(())
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.specs
    }

    pub async fn register_rollback_action(&self, component: &str, action: Arc<dyn Command>) {
        self.engine.register_rollback_action(component, action).await;
    }

    pub async fn register_cleanup_action(&self, component: &str, action: Arc<dyn Command>) {
        self.engine.register_cleanup_action(component, action).await;
    }

    pub async fn track_resource(&self, kind: ResourceKind, identifier: &str, owner: &str) -> bool {
        self.engine.track_resource(kind, identifier, owner).await
    }

    pub fn components(&self) -> &ComponentTracker {
        &self.tracker
    }

    pub fn engine(&self) -> &Arc<RollbackEngine> {
        &self.engine
    }

    fn build_scheduler(&self) -> Result<Scheduler> {
        let mut scheduler = Scheduler::with_executor(self.executor.clone());
        for spec in &self.specs {
            scheduler.add(spec.to_task(&self.config))?;
        }
        Ok(scheduler)
    }

    /// Check the task graph without running anything.
    pub fn validate(&self) -> Result<()> {
        self.build_scheduler()?.validate().map(|_| ())
    }

    /// Component `c` depends on `d` when any task of `c` depends on a task of `d`.
    fn component_dependencies(&self) -> Vec<(String, Vec<String>)> {
        let owner: HashMap<&str, &str> = self
            .specs
            .iter()
            .map(|s| (s.name.as_str(), s.component_name()))
            .collect();
        let mut deps: Vec<(String, Vec<String>)> = Vec::new();
        for spec in &self.specs {
            let component = spec.component_name();
            let idx = match deps.iter().position(|(c, _)| c == component) {
                Some(i) => i,
                None => {
                    deps.push((component.to_string(), Vec::new()));
                    deps.len() - 1
                }
            };
            for dep in &spec.dependencies {
                if let Some(&dep_component) = owner.get(dep.as_str()) {
                    if dep_component != component
                        && !deps[idx].1.iter().any(|d| d == dep_component)
                    {
                        deps[idx].1.push(dep_component.to_string());
                    }
                }
            }
        }
        deps
    }

    /// Run every task, maintain component state and roll back as configured.
    ///
    /// Configuration errors are returned before any task runs.
    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.config.validate()?;
        let mut scheduler = self.build_scheduler()?;
        scheduler.validate()?;

        let mode = options.rollback_mode.unwrap_or(self.config.rollback_mode);
        flog!(
            "Run {} starting: {} task(s), rollback mode {:?}",
            run_id,
            self.specs.len(),
            mode
        );

        let mut outstanding: HashMap<String, usize> = HashMap::new();
        for (component, deps) in self.component_dependencies() {
            self.tracker.register(&component).await;
            self.engine.declare_dependencies(&component, &deps).await;
            outstanding.insert(component, 0);
        }
        for spec in &self.specs {
            *outstanding.entry(spec.component_name().to_string()).or_default() += 1;
        }

        let coordinator = Coordinator {
            tracker: self.tracker.clone(),
            engine: Arc::clone(&self.engine),
            resources: self
                .specs
                .iter()
                .map(|s| (s.name.clone(), s.resources.clone()))
                .collect(),
            outstanding,
            rolled_back: HashSet::new(),
            rollbacks: Vec::new(),
            mode,
            observer: options.observer,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let schedule_options = ScheduleOptions {
            max_parallel: options.max_parallel.or(self.config.max_parallel),
            global_timeout: options.global_timeout.or(self.config.global_timeout()),
            events: Some(tx),
            cancel: options.cancel,
        };

        let (schedule, component_rollbacks) = tokio::join!(
            scheduler.execute_with(schedule_options),
            coordinator.consume(rx)
        );
        let schedule = schedule?;

        let full_rollback = match mode {
            RollbackMode::Disabled => false,
            RollbackMode::Component => schedule.cancelled,
            RollbackMode::Full => schedule.cancelled || !schedule.overall_success,
        };
        let rollback = if full_rollback {
            Some(self.engine.full_system_rollback(&self.tracker).await)
        } else {
            None
        };

        let components = self.tracker.generate_status_report().await;
        let report = RunReport {
            run_id,
            started_at,
            ended_at: Utc::now(),
            overall_success: schedule.overall_success,
            cancelled: schedule.cancelled,
            schedule,
            components,
            component_rollbacks,
            rollback,
        };
        flog!(
            "Run {} finished: success={} cancelled={} rolled back={:?}",
            run_id,
            report.overall_success,
            report.cancelled,
            report.rolled_back_components()
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tasks", &self.specs.len())
            .finish_non_exhaustive()
    }
}

/// Consumes scheduler events and keeps component state in step.
struct Coordinator {
    tracker: ComponentTracker,
    engine: Arc<RollbackEngine>,
    resources: HashMap<String, Vec<(ResourceKind, String)>>,
    /// Tasks per component that are not yet terminal.
    outstanding: HashMap<String, usize>,
    rolled_back: HashSet<String>,
    rollbacks: Vec<ComponentRollback>,
    mode: RollbackMode,
    observer: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Coordinator {
    async fn consume(
        mut self,
        mut rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    ) -> Vec<ComponentRollback> {
        while let Some(event) = rx.recv().await {
            self.handle(&event).await;
            if let Some(observer) = &self.observer {
                let _ = observer.send(event);
            }
        }
        self.rollbacks
    }

    fn finish_task(&mut self, component: &str) -> usize {
        let left = self.outstanding.entry(component.to_string()).or_default();
        *left = left.saturating_sub(1);
        *left
    }

    async fn handle(&mut self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::TaskStarted { component, .. } => {
                if self.tracker.status(component).await != Some(ComponentStatus::InProgress) {
                    if let Err(e) = self.tracker.start_component(component).await {
                        flog_warn!("Cannot start component {}: {}", component, e);
                    }
                }
            }
            SchedulerEvent::TaskSucceeded {
                task, component, ..
            } => {
                for (kind, identifier) in self.resources.get(task).cloned().unwrap_or_default() {
                    self.engine.track_resource(kind, &identifier, component).await;
                }
                let left = self.finish_task(component);
                if left == 0
                    && self.tracker.status(component).await == Some(ComponentStatus::InProgress)
                {
                    if let Err(e) = self.tracker.complete_component(component).await {
                        flog_warn!("Cannot complete component {}: {}", component, e);
                    }
                }
                // a failed sibling may have been waiting on this task
                self.maybe_rollback(component).await;
            }
            SchedulerEvent::TaskFailed {
                task,
                component,
                error,
                ..
            } => {
                self.finish_task(component);
                self.fail(component, &format!("task {} failed: {}", task, error))
                    .await;
                self.maybe_rollback(component).await;
            }
            SchedulerEvent::TaskSkipped {
                task,
                component,
                reason,
                ..
            } => {
                self.finish_task(component);
                self.fail(component, &format!("task {} not run: {}", task, reason))
                    .await;
                self.maybe_rollback(component).await;
            }
            SchedulerEvent::Progress(_)
            | SchedulerEvent::Cancelled { .. }
            | SchedulerEvent::AllTasksComplete => {}
        }
    }

    /// Fail a component that is in progress. Components that never started
    /// stay NotStarted.
    async fn fail(&self, component: &str, reason: &str) {
        if self.tracker.status(component).await == Some(ComponentStatus::InProgress) {
            if let Err(e) = self.tracker.fail_component(component, reason).await {
                flog_warn!("Cannot fail component {}: {}", component, e);
            }
        } else {
            flog_debug!("Component {} not in progress, leaving status: {}", component, reason);
        }
    }

    async fn maybe_rollback(&mut self, component: &str) {
        if self.mode == RollbackMode::Disabled || self.rolled_back.contains(component) {
            return;
        }
        if self.tracker.status(component).await != Some(ComponentStatus::Failed) {
            return;
        }
        if self.outstanding.get(component).copied().unwrap_or(0) > 0 {
            flog_debug!("Component {} failed but still has tasks in flight", component);
            return;
        }
        self.rolled_back.insert(component.to_string());
        let outcome = self.engine.rollback_component_report(component).await;
        let _ = self.tracker.mark_rolled_back(component).await;
        self.rollbacks.push(outcome);
    }
}
