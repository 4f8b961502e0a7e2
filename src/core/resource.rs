//! Ledger of infrastructure created during a run.
//!
//! Entries are appended as tasks create things and only removed once the
//! rollback engine has deleted them (or confirmed they are already gone),
//! or when a caller explicitly forgets one. The ledger persists as JSON so
//! a later `labforge cleanup` can find what an earlier run left behind.

use crate::error::Result;
use crate::{flog_debug, flog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    K8sObject,
    Filesystem,
    Other,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::K8sObject => write!(f, "k8s_object"),
            ResourceKind::Filesystem => write!(f, "filesystem"),
            ResourceKind::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "container" | "docker" => Ok(Self::Container),
            "k8s_object" | "k8s" | "kubernetes" => Ok(Self::K8sObject),
            "filesystem" | "file" | "path" => Ok(Self::Filesystem),
            "other" => Ok(Self::Other),
            other => Err(crate::error::Error::Plan(format!(
                "unknown resource kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    /// Container name, `kind/name` (optionally `-n namespace`) or a path.
    pub identifier: String,
    pub owning_component: String,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(kind: ResourceKind, identifier: &str, owner: &str) -> Self {
        Self {
            kind,
            identifier: identifier.to_string(),
            owning_component: owner.to_string(),
            created_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (owner {})",
            self.kind, self.identifier, self.owning_component
        )
    }
}

/// Append-only list of tracked resources, oldest first.
///
/// Clones share the same entries.
#[derive(Clone, Default)]
pub struct ResourceLedger {
    entries: Arc<Mutex<Vec<Resource>>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource. Returns false if the same kind and identifier is
    /// already tracked.
    pub async fn track(&self, kind: ResourceKind, identifier: &str, owner: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if entries
            .iter()
            .any(|r| r.kind == kind && r.identifier == identifier)
        {
            flog_debug!("Resource {} {} already tracked", kind, identifier);
            return false;
        }
        entries.push(Resource::new(kind, identifier, owner));
        flog_debug!("Tracking {} {} for {}", kind, identifier, owner);
        true
    }

    /// Drop every entry with this identifier without deleting anything.
    pub async fn forget(&self, identifier: &str) -> Vec<Resource> {
        let mut entries = self.entries.lock().await;
        let (removed, kept): (Vec<Resource>, Vec<Resource>) = entries
            .drain(..)
            .partition(|r| r.identifier == identifier);
        *entries = kept;
        removed
    }

    /// Remove one entry after its deletion succeeded.
    pub(crate) async fn release(&self, resource: &Resource) {
        let mut entries = self.entries.lock().await;
        entries.retain(|r| !(r.kind == resource.kind && r.identifier == resource.identifier));
    }

    pub async fn owned_by(&self, component: &str) -> Vec<Resource> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|r| r.owning_component == component)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Resource> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = {
            let entries = self.entries.lock().await;
            serde_json::to_string_pretty(&*entries)?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        flog_debug!("Resource ledger saved to {}", path.display());
        Ok(())
    }

    /// Merge entries from a saved ledger. A missing file loads nothing.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let saved: Vec<Resource> = serde_json::from_str(&contents)?;
        let mut loaded = 0;
        let mut entries = self.entries.lock().await;
        for resource in saved {
            if entries
                .iter()
                .any(|r| r.kind == resource.kind && r.identifier == resource.identifier)
            {
                continue;
            }
            entries.push(resource);
            loaded += 1;
        }
        if loaded > 0 {
            flog_warn!(
                "Loaded {} resource(s) left over from a previous run",
                loaded
            );
        }
        Ok(loaded)
    }
}

impl std::fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLedger").finish_non_exhaustive()
    }
}
