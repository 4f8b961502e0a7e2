//! Transactional undo for partially applied deployments.
//!
//! Components register undo commands while they are being built. When a
//! component fails, its undo commands run newest first and the resources it
//! created are deleted. Everything is best effort: a failing undo step is
//! logged and recorded, and the remaining steps still run.

use crate::cleanup::{delete_all, CleanupReport, ResourceDeleter, SystemDeleter};
use crate::config::DEFAULT_ROLLBACK_TIMEOUT_SECS;
use crate::core::command::Command;
use crate::core::component::{ComponentStatus, ComponentTracker};
use crate::core::dag::DependencyGraph;
use crate::core::resource::{Resource, ResourceKind, ResourceLedger};
use crate::core::task::RetryPolicy;
use crate::error::{Error, Result};
use crate::orchestration::executor::RetryExecutor;
use crate::{flog, flog_debug, flog_error, flog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

/// An undo or cleanup command registered for a component.
#[derive(Clone)]
pub struct RegisteredAction {
    pub component: String,
    pub action: Arc<dyn Command>,
    pub description: String,
    pub registered_at: DateTime<Utc>,
}

impl RegisteredAction {
    pub fn new(component: &str, action: Arc<dyn Command>) -> Self {
        let description = action.describe();
        Self {
            component: component.to_string(),
            action,
            description,
            registered_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("component", &self.component)
            .field("description", &self.description)
            .finish()
    }
}

pub type RollbackAction = RegisteredAction;
pub type CleanupAction = RegisteredAction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub component: String,
    pub description: String,
    pub error: String,
}

/// Outcome of rolling back one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRollback {
    pub component: String,
    /// True only if every undo action ran cleanly and every resource is gone.
    pub success: bool,
    pub actions_run: usize,
    pub action_failures: Vec<ActionFailure>,
    pub removed: Vec<Resource>,
    /// Resources that could not be deleted, with the reason.
    pub orphaned: Vec<(Resource, String)>,
    pub rolled_back_at: DateTime<Utc>,
}

/// Outcome of a full system rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Components in the order they were rolled back.
    pub components: Vec<ComponentRollback>,
    pub cleanup: CleanupReport,
    pub orphaned: Vec<Resource>,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        self.components.iter().all(|c| c.success) && self.cleanup.is_success()
    }

    pub fn rolled_back(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.component.as_str()).collect()
    }

    pub fn action_failures(&self) -> Vec<ActionFailure> {
        let mut failures: Vec<ActionFailure> = self
            .components
            .iter()
            .flat_map(|c| c.action_failures.iter().cloned())
            .collect();
        failures.extend(self.cleanup.actions_failed.iter().map(|(component, description, error)| {
            ActionFailure {
                component: component.clone(),
                description: description.clone(),
                error: error.clone(),
            }
        }));
        failures
    }
}

/// Tracks undo actions and resources, and executes rollbacks.
///
/// Every method takes `&self`; share the engine behind an `Arc`.
pub struct RollbackEngine {
    ledger: ResourceLedger,
    deleter: Arc<dyn ResourceDeleter>,
    executor: RetryExecutor,
    rollback_timeout: Duration,
    rollbacks: Mutex<HashMap<String, Vec<RegisteredAction>>>,
    cleanups: Mutex<Vec<RegisteredAction>>,
    components: Mutex<DependencyGraph>,
    outcomes: Mutex<HashMap<String, Arc<OnceCell<ComponentRollback>>>>,
}

impl Default for RollbackEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(DEFAULT_ROLLBACK_TIMEOUT_SECS))
    }
}

impl RollbackEngine {
    pub fn new(rollback_timeout: Duration) -> Self {
        Self {
            ledger: ResourceLedger::new(),
            deleter: Arc::new(SystemDeleter::new().with_timeout(rollback_timeout)),
            executor: RetryExecutor::new(),
            rollback_timeout,
            rollbacks: Mutex::new(HashMap::new()),
            cleanups: Mutex::new(Vec::new()),
            components: Mutex::new(DependencyGraph::new()),
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_deleter(mut self, deleter: Arc<dyn ResourceDeleter>) -> Self {
        self.deleter = deleter;
        self
    }

    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_ledger(mut self, ledger: ResourceLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Make a component known for rollback ordering. Idempotent.
    pub async fn register_component(&self, component: &str) {
        self.components.lock().await.add_node(component);
    }

    /// Record that `component` is built on top of `dependencies`.
    pub async fn declare_dependencies(&self, component: &str, dependencies: &[String]) {
        let mut graph = self.components.lock().await;
        graph.add_node(component);
        for dep in dependencies {
            if dep == component {
                continue;
            }
            graph.add_node(dep);
            // Both nodes exist, so this cannot fail.
            let _ = graph.add_dependency(component, dep);
        }
    }

    pub async fn track_resource(&self, kind: ResourceKind, identifier: &str, owner: &str) -> bool {
        self.register_component(owner).await;
        self.ledger.track(kind, identifier, owner).await
    }

    /// Stop tracking a resource without deleting it.
    pub async fn forget_resource(&self, identifier: &str) -> Vec<Resource> {
        let forgotten = self.ledger.forget(identifier).await;
        if !forgotten.is_empty() {
            flog_debug!("Forgot {} resource(s) named {}", forgotten.len(), identifier);
        }
        forgotten
    }

    pub async fn register_rollback_action(&self, component: &str, action: Arc<dyn Command>) {
        self.register_component(component).await;
        let action = RegisteredAction::new(component, action);
        flog_debug!(
            "Rollback action for {}: {}",
            component,
            action.description
        );
        self.rollbacks
            .lock()
            .await
            .entry(component.to_string())
            .or_default()
            .push(action);
    }

    pub async fn register_cleanup_action(&self, component: &str, action: Arc<dyn Command>) {
        self.register_component(component).await;
        let action = RegisteredAction::new(component, action);
        flog_debug!("Cleanup action for {}: {}", component, action.description);
        self.cleanups.lock().await.push(action);
    }

    pub async fn rollback_actions(&self, component: &str) -> Vec<RegisteredAction> {
        self.rollbacks
            .lock()
            .await
            .get(component)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `component` has already been rolled back.
    pub async fn has_rolled_back(&self, component: &str) -> bool {
        let cell = self.outcomes.lock().await.get(component).cloned();
        cell.map(|c| c.initialized()).unwrap_or(false)
    }

    /// Roll back one component. Returns true if everything was undone.
    pub async fn rollback_component(&self, component: &str) -> bool {
        self.rollback_component_report(component).await.success
    }

    /// Roll back one component, at most once per engine.
    ///
    /// Later calls return the first outcome without running anything.
    pub async fn rollback_component_report(&self, component: &str) -> ComponentRollback {
        let cell = {
            let mut outcomes = self.outcomes.lock().await;
            Arc::clone(outcomes.entry(component.to_string()).or_default())
        };
        cell.get_or_init(|| self.run_component_rollback(component))
            .await
            .clone()
    }

    async fn run_component_rollback(&self, component: &str) -> ComponentRollback {
        flog!("Rolling back component {}", component);
        let actions = self.rollback_actions(component).await;
        let (actions_run, action_failures) = self.run_actions(actions, "rollback").await;

        let owned = self.ledger.owned_by(component).await;
        let ledger = self.ledger.clone();
        let deleted = delete_all(self.deleter.as_ref(), owned, |r| {
            let ledger = ledger.clone();
            async move { ledger.release(&r).await }
        })
        .await;

        let success = action_failures.is_empty() && deleted.failed.is_empty();
        if success {
            flog!(
                "Component {} rolled back ({} action(s), {} resource(s))",
                component,
                actions_run,
                deleted.removed.len()
            );
        } else {
            flog_warn!(
                "Component {} rolled back with {} failed action(s) and {} orphaned resource(s); manual intervention required",
                component,
                action_failures.len(),
                deleted.failed.len()
            );
        }

        ComponentRollback {
            component: component.to_string(),
            success,
            actions_run,
            action_failures,
            removed: deleted.removed,
            orphaned: deleted.failed,
            rolled_back_at: Utc::now(),
        }
    }

    /// Run actions newest first, continuing past failures.
    async fn run_actions(
        &self,
        actions: Vec<RegisteredAction>,
        kind: &str,
    ) -> (usize, Vec<ActionFailure>) {
        let policy = RetryPolicy::once(self.rollback_timeout);
        let mut failures = Vec::new();
        let mut run = 0;
        for action in actions.iter().rev() {
            let label = format!("{}:{}", kind, action.component);
            let result = self
                .executor
                .execute(action.action.as_ref(), &policy, &label)
                .await;
            run += 1;
            if !result.succeeded {
                let error = result.error.unwrap_or_default();
                flog_error!(
                    "{} action '{}' for {} failed: {}",
                    kind,
                    action.description,
                    action.component,
                    error
                );
                failures.push(ActionFailure {
                    component: action.component.clone(),
                    description: action.description.clone(),
                    error,
                });
            }
        }
        (run, failures)
    }

    async fn run_cleanup_actions<F>(&self, include: F) -> CleanupReport
    where
        F: Fn(&RegisteredAction) -> bool,
    {
        let actions: Vec<RegisteredAction> = self
            .cleanups
            .lock()
            .await
            .iter()
            .filter(|a| include(a))
            .cloned()
            .collect();
        let (actions_run, failures) = self.run_actions(actions, "cleanup").await;
        CleanupReport {
            actions_run,
            actions_failed: failures
                .into_iter()
                .map(|f| (f.component, f.description, f.error))
                .collect(),
            ..Default::default()
        }
    }

    /// Order in which the given components should be undone.
    async fn rollback_order(&self, components: &[String]) -> Vec<String> {
        let graph = self.components.lock().await;
        match graph.rollback_order(components) {
            Ok(order) => order,
            Err(e) => {
                flog_warn!("{}; rolling back in reverse registration order", e);
                let known = graph.names();
                let mut order: Vec<String> = components
                    .iter()
                    .filter(|c| !known.contains(&c.as_str()))
                    .cloned()
                    .collect();
                order.extend(
                    known
                        .iter()
                        .rev()
                        .filter(|n| components.iter().any(|c| c == *n))
                        .map(|n| n.to_string()),
                );
                order
            }
        }
    }

    /// Undo everything that was started, dependents first, then run every
    /// cleanup action.
    pub async fn full_system_rollback(&self, tracker: &ComponentTracker) -> RollbackReport {
        let started: Vec<String> = tracker
            .snapshot()
            .await
            .into_iter()
            .filter(|c| c.status != ComponentStatus::NotStarted)
            .map(|c| c.name)
            .collect();
        let order = self.rollback_order(&started).await;
        flog!("Full system rollback of {} component(s): {:?}", order.len(), order);

        let mut report = RollbackReport::default();
        for component in order {
            let outcome = self.rollback_component_report(&component).await;
            let _ = tracker.mark_rolled_back(&component).await;
            report
                .orphaned
                .extend(outcome.orphaned.iter().map(|(r, _)| r.clone()));
            report.components.push(outcome);
        }

        report.cleanup = self.run_cleanup_actions(|_| true).await;
        if report.is_success() {
            flog!("Full system rollback complete");
        } else {
            flog_warn!(
                "Full system rollback incomplete: {} failed action(s), {} orphaned resource(s)",
                report.action_failures().len(),
                report.orphaned.len()
            );
        }
        report
    }

    /// Delete tracked resources and run cleanup actions, leaving anything
    /// owned by an in-progress component alone.
    pub async fn safe_cleanup(
        &self,
        confirm: bool,
        tracker: &ComponentTracker,
    ) -> Result<CleanupReport> {
        if !confirm {
            return Err(Error::CleanupNotConfirmed);
        }

        let mut busy = Vec::new();
        for component in tracker.snapshot().await {
            if component.status == ComponentStatus::InProgress {
                busy.push(component.name);
            }
        }

        let mut report = self
            .run_cleanup_actions(|a| !busy.contains(&a.component))
            .await;

        let mut deletable = Vec::new();
        for resource in self.ledger.all().await {
            if busy.contains(&resource.owning_component) {
                let reason = format!("component {} is in progress", resource.owning_component);
                report.skipped.push((resource, reason));
            } else {
                deletable.push(resource);
            }
        }

        let ledger = self.ledger.clone();
        let deleted = delete_all(self.deleter.as_ref(), deletable, |r| {
            let ledger = ledger.clone();
            async move { ledger.release(&r).await }
        })
        .await;
        report.merge(deleted);

        flog!(
            "Cleanup finished: {} removed, {} skipped, {} failed",
            report.removed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Delete everything tracked and run every cleanup action, without
    /// asking and without looking at component status.
    pub async fn emergency_cleanup(&self) -> CleanupReport {
        flog_warn!("Emergency cleanup requested");
        let mut report = self.run_cleanup_actions(|_| true).await;
        let ledger = self.ledger.clone();
        let deleted = delete_all(self.deleter.as_ref(), self.ledger.all().await, |r| {
            let ledger = ledger.clone();
            async move { ledger.release(&r).await }
        })
        .await;
        report.merge(deleted);
        report
    }

    pub async fn save_ledger(&self, path: &Path) -> Result<()> {
        self.ledger.save(path).await
    }

    /// Merge a saved ledger into this engine, registering the owners.
    pub async fn load_ledger(&self, path: &Path) -> Result<usize> {
        let loaded = self.ledger.load(path).await?;
        for resource in self.ledger.all().await {
            self.register_component(&resource.owning_component).await;
        }
        Ok(loaded)
    }
}

impl std::fmt::Debug for RollbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackEngine")
            .field("rollback_timeout", &self.rollback_timeout)
            .finish_non_exhaustive()
    }
}
