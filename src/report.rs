//! Final status document of a run.
//!
//! Written as JSON next to the ledger so `labforge status` can show the
//! last run without re-executing anything.

use crate::core::component::ComponentSummary;
use crate::error::Result;
use crate::flog_debug;
use crate::orchestration::executor::{ExecutionResult, FailureKind};
use crate::orchestration::orchestrator::RunReport;
use crate::orchestration::rollback::{ComponentRollback, RollbackReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

/// One task line of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub name: String,
    pub succeeded: bool,
    pub attempts: u32,
    pub elapsed_seconds: f64,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl From<&ExecutionResult> for TaskSummary {
    fn from(r: &ExecutionResult) -> Self {
        Self {
            name: r.task_name.clone(),
            succeeded: r.succeeded,
            attempts: r.attempts,
            elapsed_seconds: r.elapsed_seconds,
            error: r.error.clone(),
            failure: r.failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub components: Vec<ComponentSummary>,
    pub tasks: Vec<TaskSummary>,
    pub overall_success: bool,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_rollbacks: Vec<ComponentRollback>,
    pub rollback: Option<RollbackReport>,
}

impl From<&RunReport> for StatusReport {
    fn from(run: &RunReport) -> Self {
        Self {
            run_id: run.run_id,
            timestamp: run.ended_at,
            components: run.components.components.clone(),
            tasks: run.schedule.results.iter().map(TaskSummary::from).collect(),
            overall_success: run.overall_success,
            cancelled: run.cancelled,
            component_rollbacks: run.component_rollbacks.clone(),
            rollback: run.rollback.clone(),
        }
    }
}

impl StatusReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        flog_debug!("Status report written to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Resources that rollback could not remove.
    pub fn orphaned(&self) -> Vec<String> {
        let mut orphaned: Vec<String> = self
            .component_rollbacks
            .iter()
            .flat_map(|c| c.orphaned.iter().map(|(r, _)| r.to_string()))
            .collect();
        if let Some(rollback) = &self.rollback {
            for r in &rollback.orphaned {
                let line = r.to_string();
                if !orphaned.contains(&line) {
                    orphaned.push(line);
                }
            }
        }
        orphaned
    }

    /// Human-readable summary for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let verdict = if self.cancelled {
            "CANCELLED"
        } else if self.overall_success {
            "SUCCEEDED"
        } else {
            "FAILED"
        };
        let _ = writeln!(out, "Run {} {}", self.run_id, verdict);
        let _ = writeln!(out);

        let _ = writeln!(out, "Tasks:");
        for task in &self.tasks {
            let mark = if task.succeeded { "ok" } else { "FAILED" };
            let _ = write!(
                out,
                "  {:<24} {:<7} attempts={} {:.1}s",
                task.name, mark, task.attempts, task.elapsed_seconds
            );
            if let Some(error) = &task.error {
                let _ = write!(out, "  ({})", error);
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "Components:");
        for c in &self.components {
            let _ = write!(out, "  {:<24} {}", c.name, c.status);
            if let Some(d) = c.duration_seconds {
                let _ = write!(out, " {:.1}s", d);
            }
            if c.rolled_back {
                let _ = write!(out, " [rolled back]");
            }
            if let Some(reason) = &c.failure_reason {
                let _ = write!(out, "  ({})", reason);
            }
            let _ = writeln!(out);
        }

        let orphaned = self.orphaned();
        if !orphaned.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "Warning: {} resource(s) could not be removed. Manual intervention required:",
                orphaned.len()
            );
            for line in orphaned {
                let _ = writeln!(out, "  - {}", line);
            }
        }
        out
    }
}
