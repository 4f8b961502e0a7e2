//! End-to-end deployment runs through the orchestrator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use labforge::core::component::ComponentStatus;
use labforge::orchestration::{FailureKind, SchedulerEvent};
use labforge::plan::DeploymentPlan;
use labforge::report::StatusReport;
use labforge::{Orchestrator, RollbackMode, RunOptions, TaskSpec};

use crate::fixtures::{
    always_failing, counting, entries, event_log, fake_engine, fast_config, recording,
    recording_executor, sleeping, succeeding,
};

/// Test: setup -> validate -> deploy where deploy always fails
/// Given deploy has max_retries = 2
/// When the run finishes
/// Then deploy failed after 3 attempts, setup and validate succeeded and
/// only deploy's component was rolled back
#[tokio::test]
async fn test_failed_deploy_rolls_back_only_deploy() {
    let log = event_log();
    let deploy_calls = Arc::new(AtomicU32::new(0));
    let (executor, _) = recording_executor();
    let (engine, _) = fake_engine();

    let mut orch = Orchestrator::new(fast_config())
        .with_engine(engine)
        .with_executor(executor);
    orch.add_task(TaskSpec::new("setup", succeeding())).unwrap();
    orch.add_task(TaskSpec::new("validate", succeeding()).depends_on(["setup"]))
        .unwrap();
    orch.add_task(
        TaskSpec::new("deploy", always_failing(deploy_calls.clone()))
            .depends_on(["validate"])
            .max_retries(2)
            .retry_delay(Duration::from_secs(5)),
    )
    .unwrap();
    for name in ["setup", "validate", "deploy"] {
        orch.register_rollback_action(name, recording(log.clone(), name))
            .await;
    }

    let report = orch.run(RunOptions::default()).await.unwrap();

    assert!(!report.overall_success);
    assert!(!report.cancelled);
    let deploy = report.schedule.get("deploy").unwrap();
    assert!(!deploy.succeeded);
    assert_eq!(deploy.attempts, 3);
    assert_eq!(deploy_calls.load(Ordering::SeqCst), 3);
    assert!(report.schedule.get("setup").unwrap().succeeded);
    assert!(report.schedule.get("validate").unwrap().succeeded);

    assert_eq!(report.rolled_back_components(), vec!["deploy"]);
    assert_eq!(entries(&log), vec!["deploy"]);
    assert_eq!(
        orch.components().status("setup").await,
        Some(ComponentStatus::Complete)
    );
    assert_eq!(
        orch.components().status("deploy").await,
        Some(ComponentStatus::Failed)
    );
}

/// Test: Full rollback mode over db, cache and api
/// Given api depends on db and cache, and api fails
/// When the run finishes in full rollback mode
/// Then api is undone first, then cache and db, and all are marked rolled back
#[tokio::test]
async fn test_full_mode_rolls_back_in_reverse_dependency_order() {
    let log = event_log();
    let (engine, _) = fake_engine();
    let mut orch = Orchestrator::new(fast_config()).with_engine(engine);
    orch.add_task(TaskSpec::new("db", succeeding())).unwrap();
    orch.add_task(TaskSpec::new("cache", succeeding())).unwrap();
    orch.add_task(
        TaskSpec::new("api", always_failing(Arc::new(AtomicU32::new(0))))
            .depends_on(["db", "cache"]),
    )
    .unwrap();
    for name in ["db", "cache", "api"] {
        orch.register_rollback_action(name, recording(log.clone(), name))
            .await;
    }

    let report = orch
        .run(RunOptions {
            rollback_mode: Some(RollbackMode::Full),
            ..Default::default()
        })
        .await
        .unwrap();

    let order = entries(&log);
    assert_eq!(order.len(), 3);
    assert_eq!(order[0], "api");

    let full = report.rollback.as_ref().unwrap();
    assert_eq!(full.rolled_back()[0], "api");
    let mut all = report.rolled_back_components();
    all.sort();
    assert_eq!(all, vec!["api", "cache", "db"]);

    let status = StatusReport::from(&report);
    assert!(status.components.iter().all(|c| c.rolled_back));
}

/// Test: Cancellation triggers full rollback
/// Given a running deployment and an external cancel
/// When the token is cancelled mid-run
/// Then pending tasks never run and everything started is rolled back
#[tokio::test]
async fn test_cancel_rolls_back_everything_started() {
    let log = event_log();
    let later = Arc::new(AtomicU32::new(0));
    let (engine, _) = fake_engine();
    let mut orch = Orchestrator::new(fast_config()).with_engine(engine);
    orch.add_task(TaskSpec::new("cluster", sleeping(Duration::from_millis(300))))
        .unwrap();
    orch.add_task(TaskSpec::new("ingress", counting(later.clone())).depends_on(["cluster"]))
        .unwrap();
    orch.register_rollback_action("cluster", recording(log.clone(), "delete cluster"))
        .await;
    orch.register_rollback_action("ingress", recording(log.clone(), "delete ingress"))
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = orch
        .run(RunOptions {
            cancel: Some(cancel),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(!report.overall_success);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(
        report.schedule.get("ingress").unwrap().failure,
        Some(FailureKind::Cancelled)
    );
    assert!(report.rollback.is_some());
    assert_eq!(entries(&log), vec!["delete cluster"]);
    assert_eq!(
        orch.components().status("ingress").await,
        Some(ComponentStatus::NotStarted)
    );
}

/// Test: Observer sees the whole run
/// Given an observer channel
/// When a two-task run completes
/// Then it receives start and success events for both tasks and the final event
#[tokio::test]
async fn test_observer_sees_every_task() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut orch = Orchestrator::new(fast_config());
    orch.add_task(TaskSpec::new("a", succeeding())).unwrap();
    orch.add_task(TaskSpec::new("b", succeeding()).depends_on(["a"]))
        .unwrap();

    let report = orch
        .run(RunOptions {
            observer: Some(tx),
            max_parallel: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(report.overall_success);

    let mut started = Vec::new();
    let mut succeeded = Vec::new();
    let mut last = None;
    while let Some(event) = rx.recv().await {
        match &event {
            SchedulerEvent::TaskStarted { task, .. } => started.push(task.clone()),
            SchedulerEvent::TaskSucceeded { task, .. } => succeeded.push(task.clone()),
            _ => {}
        }
        last = Some(event);
    }
    assert_eq!(started, vec!["a", "b"]);
    assert_eq!(succeeded, vec!["a", "b"]);
    assert_eq!(last, Some(SchedulerEvent::AllTasksComplete));
}

/// Test: Shell plan with filesystem resources
/// Given a plan whose first task creates a directory and whose second fails
/// When the plan runs in full rollback mode
/// Then the tracked directory is deleted and the rollback command ran
#[tokio::test]
async fn test_shell_plan_cleans_up_created_files() {
    let dir = TempDir::new().unwrap();
    let volume = dir.path().join("volume");
    let marker = dir.path().join("rolled-back");
    let plan = format!(
        r#"
[[task]]
name = "volume"
command = "mkdir -p '{volume}' && touch '{volume}/data'"
component = "storage"

[[task.resource]]
kind = "filesystem"
id = "{volume}"

[[task]]
name = "app"
command = "echo starting && exit 3"
depends_on = ["volume"]
max_retries = 0

[[rollback]]
component = "storage"
command = "touch '{marker}'"
"#,
        volume = volume.display(),
        marker = marker.display()
    );
    let plan = DeploymentPlan::parse(&plan).unwrap();

    let mut orch = Orchestrator::new(fast_config());
    plan.apply(&mut orch).await.unwrap();
    let report = orch
        .run(RunOptions {
            rollback_mode: Some(RollbackMode::Full),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!report.overall_success);
    let app = report.schedule.get("app").unwrap();
    assert_eq!(app.failure, Some(FailureKind::Execution));
    assert!(app.output.contains("starting"));
    assert!(!volume.exists());
    assert!(marker.exists());
    assert!(report.rollback.unwrap().is_success());
}
