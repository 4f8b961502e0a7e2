//! labforge: dependency-ordered deployment runs with retries, timeouts and
//! rollback of partially applied infrastructure.
//!
//! ```ignore
//! let mut orch = Orchestrator::new(Config::load()?);
//! orch.add_task(TaskSpec::new("db", shell("docker run -d --name pg postgres")))?;
//! orch.add_task(TaskSpec::new("api", shell("kubectl apply -f api.yaml")).depends_on(["db"]))?;
//! orch.register_rollback_action("api", shell("kubectl delete -f api.yaml")).await;
//! let report = orch.run(RunOptions::default()).await?;
//! ```

pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod report;
pub mod util;

pub use config::{Config, RollbackMode};
pub use crate::core::command::{shell, Command, ShellCommand};
pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RunOptions, RunReport, TaskSpec};
