//! Rollback engine tests against a fake deleter.

use labforge::core::command::{from_fn, CommandError};
use labforge::core::component::{ComponentStatus, ComponentTracker};
use labforge::core::resource::ResourceKind;

use crate::fixtures::{entries, event_log, fake_engine, recording};

async fn tracker_with(states: &[(&str, ComponentStatus)]) -> ComponentTracker {
    let tracker = ComponentTracker::new();
    for (name, status) in states {
        tracker.register(name).await;
        match status {
            ComponentStatus::NotStarted => {}
            ComponentStatus::InProgress => tracker.start_component(name).await.unwrap(),
            ComponentStatus::Complete => {
                tracker.start_component(name).await.unwrap();
                tracker.complete_component(name).await.unwrap();
            }
            ComponentStatus::Failed => {
                tracker.start_component(name).await.unwrap();
                tracker.fail_component(name, "health check failed").await.unwrap();
            }
        }
    }
    tracker
}

/// Test: Full system rollback order
/// Given db: Complete, cache: Complete, api: Failed, api depends on db and cache
/// When full_system_rollback runs
/// Then api is rolled back first, then cache and db, and all three are
/// reported rolled back
#[tokio::test]
async fn test_full_rollback_dependents_first() {
    let log = event_log();
    let (engine, deleter) = fake_engine();
    for name in ["db", "cache", "api"] {
        engine
            .register_rollback_action(name, recording(log.clone(), &format!("undo {}", name)))
            .await;
    }
    engine
        .declare_dependencies("api", &["db".to_string(), "cache".to_string()])
        .await;
    engine.track_resource(ResourceKind::Container, "lab-postgres", "db").await;
    engine.track_resource(ResourceKind::Container, "lab-redis", "cache").await;
    engine.track_resource(ResourceKind::K8sObject, "deployment/api", "api").await;

    let tracker = tracker_with(&[
        ("db", ComponentStatus::Complete),
        ("cache", ComponentStatus::Complete),
        ("api", ComponentStatus::Failed),
    ])
    .await;

    let report = engine.full_system_rollback(&tracker).await;

    let order = entries(&log);
    assert_eq!(order[0], "undo api");
    assert_eq!(order.len(), 3);
    assert!(order.contains(&"undo cache".to_string()));
    assert!(order.contains(&"undo db".to_string()));

    let mut rolled_back = report.rolled_back();
    assert_eq!(rolled_back[0], "api");
    rolled_back.sort();
    assert_eq!(rolled_back, vec!["api", "cache", "db"]);
    assert!(report.is_success());

    for name in ["db", "cache", "api"] {
        assert!(tracker.get(name).await.unwrap().rolled_back_at.is_some());
    }
    assert_eq!(deleter.deleted()[0], "deployment/api");
    assert!(engine.ledger().is_empty().await);
}

/// Test: Best-effort rollback
/// Given three undo actions where the middle one fails
/// When the component is rolled back
/// Then the other two still run and the failure is reported
#[tokio::test]
async fn test_best_effort_continues_past_failures() {
    let log = event_log();
    let (engine, _) = fake_engine();
    engine
        .register_rollback_action("vault", recording(log.clone(), "first registered"))
        .await;
    engine
        .register_rollback_action(
            "vault",
            from_fn(|| async { Err(CommandError::new("vault sealed")) }),
        )
        .await;
    engine
        .register_rollback_action("vault", recording(log.clone(), "last registered"))
        .await;

    let outcome = engine.rollback_component_report("vault").await;
    assert!(!outcome.success);
    assert_eq!(outcome.actions_run, 3);
    assert_eq!(outcome.action_failures.len(), 1);
    assert_eq!(entries(&log), vec!["last registered", "first registered"]);
}

/// Test: Rollback runs once
/// Given a component already rolled back
/// When rollback is requested again
/// Then no action runs a second time
#[tokio::test]
async fn test_rollback_is_idempotent() {
    let log = event_log();
    let (engine, _) = fake_engine();
    engine
        .register_rollback_action("ingress", recording(log.clone(), "undo ingress"))
        .await;

    assert!(engine.rollback_component("ingress").await);
    assert!(engine.rollback_component("ingress").await);
    assert!(engine.has_rolled_back("ingress").await);
    assert_eq!(entries(&log).len(), 1);
}

/// Test: Orphaned resources
/// Given a component owning a resource that cannot be deleted
/// When it is rolled back
/// Then the resource is reported orphaned and stays in the ledger
#[tokio::test]
async fn test_undeletable_resource_is_orphaned() {
    let (engine, _) = fake_engine();
    engine
        .track_resource(ResourceKind::Filesystem, "stuck-volume", "monitoring")
        .await;
    engine
        .track_resource(ResourceKind::Filesystem, "gone-volume", "monitoring")
        .await;

    let outcome = engine.rollback_component_report("monitoring").await;
    assert!(!outcome.success);
    assert_eq!(outcome.orphaned.len(), 1);
    assert_eq!(outcome.orphaned[0].0.identifier, "stuck-volume");
    assert_eq!(outcome.removed.len(), 1);

    let left = engine.ledger().all().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].identifier, "stuck-volume");
}

/// Test: Untouched components are left alone
/// Given a component that never started
/// When a full system rollback runs
/// Then its undo actions are not executed
#[tokio::test]
async fn test_not_started_components_skipped() {
    let log = event_log();
    let (engine, _) = fake_engine();
    engine
        .register_rollback_action("db", recording(log.clone(), "undo db"))
        .await;
    engine
        .register_rollback_action("api", recording(log.clone(), "undo api"))
        .await;
    let tracker = tracker_with(&[
        ("db", ComponentStatus::Failed),
        ("api", ComponentStatus::NotStarted),
    ])
    .await;

    let report = engine.full_system_rollback(&tracker).await;
    assert_eq!(report.rolled_back(), vec!["db"]);
    assert_eq!(entries(&log), vec!["undo db"]);
    assert!(tracker.get("api").await.unwrap().rolled_back_at.is_none());
}

/// Test: Cleanup actions run during full rollback
/// Given cleanup actions for two components
/// When a full system rollback runs
/// Then every cleanup action runs after the undo actions
#[tokio::test]
async fn test_full_rollback_runs_cleanup_actions() {
    let log = event_log();
    let (engine, _) = fake_engine();
    engine
        .register_rollback_action("db", recording(log.clone(), "undo db"))
        .await;
    engine
        .register_cleanup_action("db", recording(log.clone(), "clean db"))
        .await;
    engine
        .register_cleanup_action("api", recording(log.clone(), "clean api"))
        .await;
    let tracker = tracker_with(&[("db", ComponentStatus::Failed)]).await;

    let report = engine.full_system_rollback(&tracker).await;
    let order = entries(&log);
    assert_eq!(order[0], "undo db");
    assert_eq!(order.len(), 3);
    assert_eq!(report.cleanup.actions_run, 2);
}
