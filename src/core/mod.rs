//! Core domain models for deployment orchestration.
//!
//! Tasks, the dependency graph over them, the components they build and
//! the resources they leave behind.

pub mod command;
pub mod component;
pub mod dag;
pub mod resource;
pub mod task;

pub use command::{Command, CommandError, CommandOutput, CommandResult, FnCommand, ShellCommand};
pub use component::{
    Component, ComponentStatus, ComponentStatusReport, ComponentSummary, ComponentTracker,
};
pub use dag::DependencyGraph;
pub use resource::{Resource, ResourceKind, ResourceLedger};
pub use task::{RetryPolicy, Task, TaskStatus};
