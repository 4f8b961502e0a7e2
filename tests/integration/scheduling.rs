//! Dependency-ordered parallel scheduling tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok};

use labforge::core::task::{RetryPolicy, TaskStatus};
use labforge::orchestration::{FailureKind, ScheduleOptions, Scheduler};
use labforge::Error;

use crate::fixtures::{always_failing, counting, sleeping, succeeding};

fn once() -> RetryPolicy {
    RetryPolicy::once(Duration::from_secs(10))
}

/// Test: Dependency ordering on a diamond
/// Given a -> {b, c} -> d
/// When the scheduler runs with room for everything
/// Then every task starts only after each of its dependencies ended
#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let mut scheduler = Scheduler::new();
    let step = || sleeping(Duration::from_millis(50));
    scheduler.add_task("a", step(), &[], once()).unwrap();
    scheduler.add_task("b", step(), &["a"], once()).unwrap();
    scheduler.add_task("c", step(), &["a"], once()).unwrap();
    scheduler.add_task("d", step(), &["b", "c"], once()).unwrap();

    let report = assert_ok!(scheduler.execute_all(Some(4)).await);
    assert!(report.overall_success);

    for task in scheduler.tasks() {
        let started = report.get(&task.name).unwrap().started_at.unwrap();
        for dep in &task.dependencies {
            let dep_ended = report.get(dep).unwrap().ended_at.unwrap();
            assert!(
                started >= dep_ended,
                "{} started before its dependency {} ended",
                task.name,
                dep
            );
        }
    }
}

/// Test: Concurrency bound
/// Given 5 independent tasks of 1s each and max_parallel = 2
/// When the scheduler runs
/// Then the run takes three waves: at least 3s and well under 5s
#[tokio::test]
async fn test_concurrency_bound() {
    let mut scheduler = Scheduler::new();
    for i in 0..5 {
        scheduler
            .add_task(&format!("t{}", i), sleeping(Duration::from_secs(1)), &[], once())
            .unwrap();
    }

    let start = Instant::now();
    let report = assert_ok!(scheduler.execute_all(Some(2)).await);
    let elapsed = start.elapsed();

    assert!(report.overall_success);
    assert!(elapsed >= Duration::from_secs(3), "took only {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
}

/// Test: Cycle detection
/// Given a -> b -> c -> a
/// When the scheduler runs
/// Then it fails with a configuration error and nothing is invoked
#[tokio::test]
async fn test_cycle_rejected_before_anything_runs() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut scheduler = Scheduler::new();
    scheduler.add_task("a", counting(calls.clone()), &["c"], once()).unwrap();
    scheduler.add_task("b", counting(calls.clone()), &["a"], once()).unwrap();
    scheduler.add_task("c", counting(calls.clone()), &["b"], once()).unwrap();

    let err = assert_err!(scheduler.execute_all(None).await);
    assert!(matches!(err, Error::CyclicDependency { .. }));
    assert!(err.is_configuration());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Test: Unknown dependency
/// Given a task that depends on a name nobody registered
/// When the scheduler runs
/// Then the run is rejected as a configuration error
#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let mut scheduler = Scheduler::new();
    scheduler.add_task("api", succeeding(), &["db"], once()).unwrap();

    let err = assert_err!(scheduler.execute_all(None).await);
    assert_eq!(err.exit_code(), 2);
}

/// Test: Dependency-failure propagation
/// Given setup fails, configure depends on setup, deploy on configure
/// When the scheduler runs
/// Then every transitive dependent is Failed and never invoked,
/// while an unrelated branch still succeeds
#[tokio::test]
async fn test_failure_propagates_transitively() {
    let failed = Arc::new(AtomicU32::new(0));
    let downstream = Arc::new(AtomicU32::new(0));
    let unrelated = Arc::new(AtomicU32::new(0));

    let mut scheduler = Scheduler::new();
    scheduler.add_task("setup", always_failing(failed.clone()), &[], once()).unwrap();
    scheduler
        .add_task("configure", counting(downstream.clone()), &["setup"], once())
        .unwrap();
    scheduler
        .add_task("deploy", counting(downstream.clone()), &["configure"], once())
        .unwrap();
    scheduler
        .add_task("monitoring", counting(unrelated.clone()), &[], once())
        .unwrap();

    let report = assert_ok!(scheduler.execute_all(Some(2)).await);
    assert!(!report.overall_success);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
    assert_eq!(unrelated.load(Ordering::SeqCst), 1);

    for name in ["configure", "deploy"] {
        let result = report.get(name).unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.failure, Some(FailureKind::DependencyFailed));
        assert_eq!(scheduler.status(name).await, Some(TaskStatus::Failed));
    }
    assert_eq!(scheduler.status("monitoring").await, Some(TaskStatus::Succeeded));
}

/// Test: Global timeout
/// Given a slow task followed by a dependent and a 200ms budget
/// When the budget runs out
/// Then the in-flight task finishes, the run is cancelled and the
/// dependent never runs
#[tokio::test]
async fn test_global_timeout_cancels_pending_work() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut scheduler = Scheduler::new();
    scheduler
        .add_task("slow", sleeping(Duration::from_millis(500)), &[], once())
        .unwrap();
    scheduler
        .add_task("after", counting(calls.clone()), &["slow"], once())
        .unwrap();

    let options = ScheduleOptions::default().with_global_timeout(Duration::from_millis(200));
    let report = assert_ok!(scheduler.execute_with(options).await);

    assert!(report.cancelled);
    assert!(!report.overall_success);
    assert!(report.get("slow").unwrap().succeeded);
    assert_eq!(
        report.get("after").unwrap().failure,
        Some(FailureKind::Cancelled)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
