//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Counting and recording commands
//! - A sleeper that records delays instead of waiting
//! - A resource deleter that never touches the host

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use labforge::cleanup::{DeleteOutcome, ResourceDeleter};
use labforge::core::command::{from_fn, labeled, Command, CommandError, CommandOutput};
use labforge::core::resource::Resource;
use labforge::orchestration::{RetryExecutor, RollbackEngine, Sleeper};
use labforge::{Config, Error, Result};

/// Shared, ordered log of what ran.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Config with no retries and no delays.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.defaults.max_retries = 0;
    config.defaults.retry_delay_secs = 0.0;
    config.defaults.timeout_secs = 10.0;
    config
}

pub fn succeeding() -> Arc<dyn Command> {
    from_fn(|| async { Ok(CommandOutput::text("ok")) })
}

/// Command that always fails, counting invocations.
pub fn always_failing(calls: Arc<AtomicU32>) -> Arc<dyn Command> {
    from_fn(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CommandError::new("exit status 1").with_exit_code(1))
        }
    })
}

/// Command that succeeds, counting invocations.
pub fn counting(calls: Arc<AtomicU32>) -> Arc<dyn Command> {
    from_fn(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandOutput::default())
        }
    })
}

/// Command that appends `entry` to `log` when it runs.
pub fn recording(log: EventLog, entry: &str) -> Arc<dyn Command> {
    let entry = entry.to_string();
    labeled(entry.clone(), move || {
        let log = log.clone();
        let entry = entry.clone();
        async move {
            log.lock().unwrap().push(entry);
            Ok(CommandOutput::default())
        }
    })
}

/// Command that sleeps for `duration` then succeeds.
pub fn sleeping(duration: Duration) -> Arc<dyn Command> {
    from_fn(move || async move {
        tokio::time::sleep(duration).await;
        Ok(CommandOutput::default())
    })
}

/// Records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.delays.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

pub fn recording_executor() -> (RetryExecutor, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::default());
    (RetryExecutor::with_sleeper(sleeper.clone()), sleeper)
}

/// Deleter that records identifiers. Identifiers starting with `stuck`
/// fail, and ones starting with `gone` are reported already absent.
#[derive(Default)]
pub struct FakeDeleter {
    deleted: Mutex<Vec<String>>,
}

impl FakeDeleter {
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

impl ResourceDeleter for FakeDeleter {
    fn delete<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, Result<DeleteOutcome>> {
        Box::pin(async move {
            if resource.identifier.starts_with("stuck") {
                return Err(Error::DeleteFailed {
                    resource: resource.identifier.clone(),
                    reason: "device or resource busy".into(),
                });
            }
            if resource.identifier.starts_with("gone") {
                return Ok(DeleteOutcome::AlreadyAbsent);
            }
            self.deleted.lock().unwrap().push(resource.identifier.clone());
            Ok(DeleteOutcome::Deleted)
        })
    }
}

pub fn fake_engine() -> (RollbackEngine, Arc<FakeDeleter>) {
    let deleter = Arc::new(FakeDeleter::default());
    let engine = RollbackEngine::new(Duration::from_secs(5)).with_deleter(deleter.clone());
    (engine, deleter)
}
