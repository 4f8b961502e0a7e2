//! Deleting tracked infrastructure.
//!
//! Cleanup is idempotent: a resource that is already gone counts as
//! deleted. Failures are collected into a [`CleanupReport`] rather than
//! aborting, so one stuck container never prevents the rest from being
//! removed.

use crate::core::resource::{Resource, ResourceKind};
use crate::error::{Error, Result};
use crate::util::blocking_with_timeout;
use crate::{flog_debug, flog_warn};
use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// How a successful deletion went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing to delete; the resource no longer existed.
    AlreadyAbsent,
    /// Nothing deletable; the entry was only dropped from the ledger.
    Released,
}

/// Removes one resource from the outside world.
pub trait ResourceDeleter: Send + Sync {
    fn delete<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, Result<DeleteOutcome>>;
}

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Resources that were deleted or found already absent.
    pub removed: Vec<Resource>,
    /// Resources left alone, with the reason.
    pub skipped: Vec<(Resource, String)>,
    /// Resources whose deletion failed. These may be orphaned.
    pub failed: Vec<(Resource, String)>,
    /// Cleanup actions that ran.
    pub actions_run: usize,
    /// Cleanup actions that failed, as `(component, description, error)`.
    pub actions_failed: Vec<(String, String, String)>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_processed(&self) -> usize {
        self.removed.len() + self.skipped.len() + self.failed.len()
    }

    /// Whether every deletion and cleanup action succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.actions_failed.is_empty()
    }

    /// Resources that may have been left behind.
    pub fn orphaned(&self) -> impl Iterator<Item = &Resource> {
        self.failed.iter().map(|(r, _)| r)
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        self.actions_run += other.actions_run;
        self.actions_failed.extend(other.actions_failed);
    }
}

/// Docker's answer when the named container does not exist
static NO_SUCH_CONTAINER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bno such container\b").unwrap());

/// Whether docker's error output means the container is already gone.
///
/// Only the container-specific message counts. Anything else, such as a
/// missing config file or an unknown context, is a real failure.
pub fn is_not_found(stderr: &str) -> bool {
    NO_SUCH_CONTAINER_RE.is_match(stderr)
}

/// Deletes resources with the host's `docker`, `kubectl` and filesystem.
#[derive(Debug, Clone)]
pub struct SystemDeleter {
    docker: String,
    kubectl: String,
    timeout: Duration,
}

impl Default for SystemDeleter {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            kubectl: "kubectl".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl SystemDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a different container CLI, e.g. `podman`.
    pub fn with_docker(mut self, program: impl Into<String>) -> Self {
        self.docker = program.into();
        self
    }

    pub fn with_kubectl(mut self, program: impl Into<String>) -> Self {
        self.kubectl = program.into();
        self
    }

    async fn run_tool(
        &self,
        resource: &Resource,
        program: &str,
        args: Vec<String>,
    ) -> Result<std::process::Output> {
        flog_debug!("Deleting {} with {} {:?}", resource, program, args);
        let child = tokio::process::Command::new(program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(delete_failed(
                resource,
                format!("failed to run {}: {}", program, e),
            )),
            Err(_) => Err(delete_failed(
                resource,
                format!("{} timed out after {:?}", program, self.timeout),
            )),
        }
    }

    async fn delete_container(&self, resource: &Resource) -> Result<DeleteOutcome> {
        let args = vec!["rm".to_string(), "-f".to_string(), resource.identifier.clone()];
        let output = self.run_tool(resource, &self.docker, args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(DeleteOutcome::AlreadyAbsent);
        }
        if output.status.success() {
            return Ok(DeleteOutcome::Deleted);
        }
        Err(delete_failed(resource, failure_text(&output)))
    }

    /// `--ignore-not-found` makes a missing object exit zero with no output,
    /// so the exit status alone decides.
    async fn delete_k8s_object(&self, resource: &Resource) -> Result<DeleteOutcome> {
        let mut args = vec!["delete".to_string()];
        args.extend(resource.identifier.split_whitespace().map(str::to_string));
        args.push("--ignore-not-found".to_string());
        let output = self.run_tool(resource, &self.kubectl, args).await?;
        if !output.status.success() {
            return Err(delete_failed(resource, failure_text(&output)));
        }
        if String::from_utf8_lossy(&output.stdout).trim().is_empty() {
            Ok(DeleteOutcome::AlreadyAbsent)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }
}

fn delete_failed(resource: &Resource, reason: impl Into<String>) -> Error {
    Error::DeleteFailed {
        resource: resource.identifier.clone(),
        reason: reason.into(),
    }
}

fn failure_text(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    match output.status.code() {
        Some(code) => format!("exited with code {}", code),
        None => "terminated by signal".to_string(),
    }
}

fn remove_path(path: &Path) -> Result<DeleteOutcome> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(DeleteOutcome::AlreadyAbsent)
        }
        Err(e) => return Err(e.into()),
    };
    let removed = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(DeleteOutcome::Deleted),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome::AlreadyAbsent),
        Err(e) => Err(e.into()),
    }
}

impl ResourceDeleter for SystemDeleter {
    fn delete<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, Result<DeleteOutcome>> {
        Box::pin(async move {
            match resource.kind {
                ResourceKind::Container => self.delete_container(resource).await,
                ResourceKind::K8sObject => self.delete_k8s_object(resource).await,
                ResourceKind::Filesystem => {
                    let path = PathBuf::from(&resource.identifier);
                    blocking_with_timeout(self.timeout, move || remove_path(&path))
                        .await
                        .map_err(|e| Error::DeleteFailed {
                            resource: resource.identifier.clone(),
                            reason: e.to_string(),
                        })
                }
                ResourceKind::Other => Ok(DeleteOutcome::Released),
            }
        })
    }
}

/// Delete `resources` one by one, newest first, collecting outcomes.
///
/// `release` is called for each resource that no longer exists so the
/// caller can drop it from its ledger.
pub async fn delete_all<F, Fut>(
    deleter: &dyn ResourceDeleter,
    resources: Vec<Resource>,
    mut release: F,
) -> CleanupReport
where
    F: FnMut(Resource) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut report = CleanupReport::new();
    for resource in resources.into_iter().rev() {
        match deleter.delete(&resource).await {
            Ok(outcome) => {
                flog_debug!("{} -> {:?}", resource, outcome);
                release(resource.clone()).await;
                report.removed.push(resource);
            }
            Err(e) => {
                flog_warn!(
                    "Could not delete {}: {}. Manual intervention may be required",
                    resource,
                    e
                );
                report.failed.push((resource, e.to_string()));
            }
        }
    }
    report
}
