//! TOML deployment plans.
//!
//! A plan lists shell tasks with their dependencies, plus undo and cleanup
//! commands per component:
//!
//! ```toml
//! [[task]]
//! name = "db"
//! command = "docker run -d --name lab-postgres postgres:16"
//! component = "database"
//! max_retries = 2
//!
//! [[task.resource]]
//! kind = "container"
//! id = "lab-postgres"
//!
//! [[rollback]]
//! component = "database"
//! command = "docker rm -f lab-postgres"
//! ```

use crate::core::command::{Command, ShellCommand};
use crate::core::resource::ResourceKind;
use crate::error::{Error, Result};
use crate::orchestration::orchestrator::{Orchestrator, TaskSpec};
use crate::flog_debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Words that are not programs looked up on PATH.
const SHELL_BUILTINS: &[&str] = &[
    "cd", "echo", "exit", "export", "set", "test", "[", "true", "false", ":", "if", "for",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResource {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub component: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<f64>,
    pub backoff_multiplier: Option<f64>,
    pub timeout_secs: Option<f64>,
    #[serde(default, rename = "resource")]
    pub resources: Vec<PlanResource>,
}

impl PlanTask {
    fn component_name(&self) -> &str {
        self.component.as_deref().unwrap_or(&self.name)
    }
}

/// An undo or cleanup command for a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAction {
    pub component: String,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    #[serde(default, rename = "task")]
    pub tasks: Vec<PlanTask>,
    #[serde(default, rename = "rollback")]
    pub rollbacks: Vec<PlanAction>,
    #[serde(default, rename = "cleanup")]
    pub cleanups: Vec<PlanAction>,
    /// Working directory for every command. Relative paths resolve against
    /// the plan file's directory.
    pub workdir: Option<String>,
}

fn seconds(task: &str, field: &str, value: Option<f64>) -> Result<Option<Duration>> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(|_| {
                Error::Plan(format!("task {}: {} must be a non-negative number", task, field))
            })
        })
        .transpose()
}

impl DeploymentPlan {
    pub fn parse(contents: &str) -> Result<Self> {
        let plan: Self = toml::from_str(contents)?;
        plan.check()?;
        Ok(plan)
    }

    /// Read a plan file. A relative `workdir` is anchored at the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        flog_debug!("Loading plan {}", path.display());
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Plan(format!("cannot read {}: {}", path.display(), e)))?;
        let mut plan = Self::parse(&contents)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        plan.workdir = Some(match plan.workdir.take() {
            Some(dir) if Path::new(&dir).is_relative() => base.join(dir).display().to_string(),
            Some(dir) => dir,
            None => base.display().to_string(),
        });
        Ok(plan)
    }

    /// Structural checks that do not need the task graph.
    fn check(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Plan("plan has no [[task]] entries".to_string()));
        }
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(Error::Plan("task with empty name".to_string()));
            }
            if task.command.trim().is_empty() {
                return Err(Error::Plan(format!("task {} has an empty command", task.name)));
            }
            for r in &task.resources {
                r.kind.parse::<ResourceKind>()?;
            }
        }

        let components: HashSet<&str> = self.tasks.iter().map(PlanTask::component_name).collect();
        for action in self.rollbacks.iter().chain(&self.cleanups) {
            if !components.contains(action.component.as_str()) {
                return Err(Error::Plan(format!(
                    "action '{}' refers to unknown component {}",
                    action.command, action.component
                )));
            }
        }
        Ok(())
    }

    fn command(&self, script: &str) -> Arc<dyn Command> {
        let mut cmd = ShellCommand::new(script);
        if let Some(dir) = &self.workdir {
            if !dir.is_empty() {
                cmd = cmd.with_workdir(PathBuf::from(dir));
            }
        }
        Arc::new(cmd)
    }

    fn task_spec(&self, task: &PlanTask) -> Result<TaskSpec> {
        let mut spec = TaskSpec::new(&task.name, self.command(&task.command))
            .depends_on(task.depends_on.iter().cloned())
            .component(task.component_name());
        if let Some(n) = task.max_retries {
            spec = spec.max_retries(n);
        }
        if let Some(d) = seconds(&task.name, "retry_delay_secs", task.retry_delay_secs)? {
            spec = spec.retry_delay(d);
        }
        if let Some(m) = task.backoff_multiplier {
            spec = spec.backoff_multiplier(m);
        }
        if let Some(t) = seconds(&task.name, "timeout_secs", task.timeout_secs)? {
            spec = spec.timeout(t);
        }
        for r in &task.resources {
            spec = spec.resource(r.kind.parse()?, &r.id);
        }
        Ok(spec)
    }

    /// Register every task and action of the plan with `orchestrator`.
    pub async fn apply(&self, orchestrator: &mut Orchestrator) -> Result<()> {
        for task in &self.tasks {
            orchestrator.add_task(self.task_spec(task)?)?;
        }
        for action in &self.rollbacks {
            orchestrator
                .register_rollback_action(&action.component, self.command(&action.command))
                .await;
        }
        for action in &self.cleanups {
            orchestrator
                .register_cleanup_action(&action.component, self.command(&action.command))
                .await;
        }
        Ok(())
    }

    /// Programs referenced by commands that are not on PATH, as
    /// `(where, program)` pairs.
    pub fn missing_programs(&self) -> Vec<(String, String)> {
        let mut scripts: Vec<(String, &str)> = self
            .tasks
            .iter()
            .map(|t| (format!("task {}", t.name), t.command.as_str()))
            .collect();
        scripts.extend(
            self.rollbacks
                .iter()
                .map(|a| (format!("rollback {}", a.component), a.command.as_str())),
        );
        scripts.extend(
            self.cleanups
                .iter()
                .map(|a| (format!("cleanup {}", a.component), a.command.as_str())),
        );

        let mut missing = Vec::new();
        for (place, script) in scripts {
            let Some(program) = ShellCommand::new(script).program().map(str::to_string) else {
                continue;
            };
            if program.contains('=') || SHELL_BUILTINS.contains(&program.as_str()) {
                continue;
            }
            if which::which(&program).is_err() {
                missing.push((place, program));
            }
        }
        missing
    }
}
