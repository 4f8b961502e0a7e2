//! Cleanup of tracked resources, including across process restarts.

use tempfile::TempDir;
use tokio_test::assert_ok;

use labforge::core::component::ComponentTracker;
use labforge::core::resource::ResourceKind;
use labforge::orchestration::RollbackEngine;
use labforge::Error;

use crate::fixtures::{entries, event_log, fake_engine, recording};

/// Test: Idempotent cleanup
/// Given a tracked path that does not exist on disk
/// When cleanup runs
/// Then it succeeds and the entry leaves the ledger
#[tokio::test]
async fn test_cleanup_of_missing_resource_succeeds() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("never-created");
    let engine = RollbackEngine::default();
    engine
        .track_resource(ResourceKind::Filesystem, missing.to_str().unwrap(), "storage")
        .await;

    let report = assert_ok!(engine.safe_cleanup(true, &ComponentTracker::new()).await);
    assert!(report.is_success());
    assert_eq!(report.removed.len(), 1);
    assert!(engine.ledger().is_empty().await);

    // a second pass has nothing left to do
    let again = assert_ok!(engine.safe_cleanup(true, &ComponentTracker::new()).await);
    assert!(again.is_success());
    assert_eq!(again.total_processed(), 0);
}

/// Test: Cleanup needs confirmation
/// Given tracked resources
/// When cleanup is not confirmed
/// Then nothing is deleted and the CLI exit code is 3
#[tokio::test]
async fn test_unconfirmed_cleanup_deletes_nothing() {
    let (engine, deleter) = fake_engine();
    engine.track_resource(ResourceKind::Container, "lab-postgres", "db").await;

    let err = engine
        .safe_cleanup(false, &ComponentTracker::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CleanupNotConfirmed));
    assert_eq!(err.exit_code(), 3);
    assert!(deleter.deleted().is_empty());
    assert_eq!(engine.ledger().len().await, 1);
}

/// Test: In-progress components are protected
/// Given resources owned by a running component and a finished one
/// When safe cleanup runs
/// Then only the finished component's resources and actions are touched
#[tokio::test]
async fn test_safe_cleanup_skips_in_progress_components() {
    let log = event_log();
    let (engine, deleter) = fake_engine();
    engine.track_resource(ResourceKind::Container, "lab-postgres", "db").await;
    engine.track_resource(ResourceKind::Container, "lab-grafana", "monitoring").await;
    engine
        .register_cleanup_action("db", recording(log.clone(), "vacuum db"))
        .await;
    engine
        .register_cleanup_action("monitoring", recording(log.clone(), "drop dashboards"))
        .await;

    let tracker = ComponentTracker::new();
    tracker.register("db").await;
    tracker.register("monitoring").await;
    tracker.start_component("db").await.unwrap();

    let report = engine.safe_cleanup(true, &tracker).await.unwrap();
    assert_eq!(deleter.deleted(), vec!["lab-grafana"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0.identifier, "lab-postgres");
    assert_eq!(entries(&log), vec!["drop dashboards"]);
}

/// Test: Emergency cleanup
/// Given a mix of deletable and stuck resources
/// When emergency cleanup runs
/// Then everything deletable is removed and the stuck one is reported
#[tokio::test]
async fn test_emergency_cleanup_reports_stuck_resources() {
    let (engine, deleter) = fake_engine();
    engine.track_resource(ResourceKind::Container, "lab-api", "api").await;
    engine.track_resource(ResourceKind::Filesystem, "stuck-mount", "storage").await;
    engine.track_resource(ResourceKind::K8sObject, "gone/ingress", "ingress").await;

    let report = engine.emergency_cleanup().await;
    assert!(!report.is_success());
    assert_eq!(report.removed.len(), 2);
    assert_eq!(report.orphaned().count(), 1);
    assert_eq!(deleter.deleted(), vec!["lab-api"]);

    let left = engine.ledger().all().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].identifier, "stuck-mount");
}

/// Test: Ledger survives a restart
/// Given one engine that tracked resources and saved its ledger
/// When a fresh engine loads the ledger and cleans up
/// Then it deletes what the first one created
#[tokio::test]
async fn test_cleanup_after_restart() {
    let dir = TempDir::new().unwrap();
    let ledger = dir.path().join("state").join("resources.json");

    let (first, _) = fake_engine();
    first.track_resource(ResourceKind::Container, "lab-vault", "vault").await;
    first.track_resource(ResourceKind::Other, "dns:lab.local", "ingress").await;
    assert_ok!(first.save_ledger(&ledger).await);

    let (second, deleter) = fake_engine();
    assert_eq!(assert_ok!(second.load_ledger(&ledger).await), 2);
    let report = assert_ok!(second.safe_cleanup(true, &ComponentTracker::new()).await);
    assert!(report.is_success());
    assert_eq!(deleter.deleted(), vec!["dns:lab.local", "lab-vault"]);

    assert_ok!(second.save_ledger(&ledger).await);
    let (third, _) = fake_engine();
    assert_eq!(assert_ok!(third.load_ledger(&ledger).await), 0);
}
