//! Retry bound and backoff tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use labforge::core::command::{from_fn, shell, CommandError, CommandOutput};
use labforge::core::task::RetryPolicy;
use labforge::orchestration::{FailureKind, RetryExecutor, Scheduler};

use crate::fixtures::{always_failing, recording_executor};

/// Test: Retry bound
/// Given an always-failing command with max_retries = 2
/// When it is executed
/// Then it is invoked exactly 3 times and the delay before the third
/// attempt is initial_delay * multiplier
#[tokio::test]
async fn test_retry_bound_and_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let (executor, sleeper) = recording_executor();
    let policy = RetryPolicy::default()
        .with_max_retries(2)
        .with_initial_delay(Duration::from_secs(5))
        .with_backoff_multiplier(2.0)
        .with_timeout(Duration::from_secs(10));

    let result = executor
        .execute(always_failing(calls.clone()).as_ref(), &policy, "deploy")
        .await;

    assert!(!result.succeeded);
    assert_eq!(result.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.failure, Some(FailureKind::Execution));
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_secs(5), Duration::from_secs(10)]
    );
}

/// Test: Wall-clock backoff
/// Given a real sleeper, a 100ms initial delay and multiplier 2
/// When a command fails twice
/// Then the gap before the third attempt is at least 200ms
#[tokio::test]
async fn test_real_delay_before_third_attempt() {
    let stamps = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let s = stamps.clone();
    let command = from_fn(move || {
        let s = s.clone();
        async move {
            s.lock().unwrap().push(Instant::now());
            Err(CommandError::new("still starting"))
        }
    });
    let policy = RetryPolicy::default()
        .with_max_retries(2)
        .with_initial_delay(Duration::from_millis(100))
        .with_backoff_multiplier(2.0)
        .with_timeout(Duration::from_secs(5));

    let result = RetryExecutor::new()
        .execute(command.as_ref(), &policy, "db")
        .await;
    assert_eq!(result.attempts, 3);

    let stamps = stamps.lock().unwrap();
    assert!(stamps[1] - stamps[0] >= Duration::from_millis(100));
    assert!(stamps[2] - stamps[1] >= Duration::from_millis(200));
}

/// Test: Flaky command recovers
/// Given a command that fails twice then succeeds
/// When it runs with max_retries = 3
/// Then it succeeds on the third attempt
#[tokio::test]
async fn test_flaky_command_succeeds_within_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let flaky = from_fn(move || {
        let c = c.clone();
        async move {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CommandError::new("connection refused"))
            } else {
                Ok(CommandOutput::text("ready"))
            }
        }
    });
    let (executor, sleeper) = recording_executor();
    let policy = RetryPolicy::default()
        .with_max_retries(3)
        .with_initial_delay(Duration::from_millis(10));

    let result = executor.execute(flaky.as_ref(), &policy, "api").await;
    assert!(result.succeeded);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.output, "ready");
    assert_eq!(sleeper.delays().len(), 2);
}

/// Test: Timeout counts as a failed attempt
/// Given a command that hangs and a 100ms per-attempt timeout
/// When it runs with one retry
/// Then both attempts time out and the failure is reported as a timeout
#[tokio::test]
async fn test_timeouts_are_retried_and_reported() {
    let hanging = from_fn(|| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(CommandOutput::default())
    });
    let (executor, _) = recording_executor();
    let policy = RetryPolicy::default()
        .with_max_retries(1)
        .with_initial_delay(Duration::ZERO)
        .with_timeout(Duration::from_millis(100));

    let start = Instant::now();
    let result = executor.execute(hanging.as_ref(), &policy, "helm").await;
    assert!(!result.succeeded);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert!(start.elapsed() < Duration::from_secs(5));
}

/// Test: Timed-out shell work is really stopped
/// Given a shell command whose subshell touches a marker after 1s
/// When its single attempt times out after 100ms
/// Then the marker never appears, even well after the deadline
#[tokio::test]
async fn test_timed_out_shell_leaves_nothing_running() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("created-late");
    let command = shell(format!("(sleep 1; touch '{}'); true", marker.display()));

    let result = RetryExecutor::new()
        .execute(
            command.as_ref(),
            &RetryPolicy::once(Duration::from_millis(100)),
            "kind",
        )
        .await;
    assert_eq!(result.failure, Some(FailureKind::Timeout));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!marker.exists());
}

/// Test: Retries through the scheduler
/// Given a scheduler built with a recording executor
/// When a task with max_retries = 2 always fails
/// Then its report shows 3 attempts
#[tokio::test]
async fn test_scheduler_reports_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let (executor, sleeper) = recording_executor();
    let mut scheduler = Scheduler::with_executor(executor);
    let policy = RetryPolicy::default()
        .with_max_retries(2)
        .with_initial_delay(Duration::from_secs(1));
    scheduler
        .add_task("deploy", always_failing(calls.clone()), &[], policy)
        .unwrap();

    let report = scheduler.execute_all(None).await.unwrap();
    assert_eq!(report.get("deploy").unwrap().attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}
