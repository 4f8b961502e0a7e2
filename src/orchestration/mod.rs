//! Orchestration layer for deployment runs.
//!
//! Tasks are executed by a retrying executor on a bounded worker pool,
//! dispatched in dependency order by the scheduler. The rollback engine
//! undoes failed components, and the orchestrator ties the pieces together
//! with component tracking.

pub mod executor;
pub mod orchestrator;
pub mod pool;
pub mod rollback;
pub mod scheduler;

pub use executor::{ExecutionResult, FailureKind, RetryExecutor, Sleeper, TokioSleeper};
pub use orchestrator::{Orchestrator, RunOptions, RunReport, TaskSpec};
pub use pool::{WorkerCompletion, WorkerPool};
pub use rollback::{
    ActionFailure, CleanupAction, ComponentRollback, RegisteredAction, RollbackAction,
    RollbackEngine, RollbackReport,
};
pub use scheduler::{
    ProgressSnapshot, ScheduleOptions, ScheduleReport, Scheduler, SchedulerEvent, StatusMap,
};
