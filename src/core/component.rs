//! Component lifecycle tracking.
//!
//! A component is a logical deployment unit (a database, a cache, an API)
//! that one or more tasks contribute to. Status only moves forward:
//! NotStarted -> InProgress -> Complete | Failed.

use crate::error::{Error, Result};
use crate::{flog, flog_debug};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

impl ComponentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ComponentStatus::Complete | ComponentStatus::Failed)
    }
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentStatus::NotStarted => write!(f, "not_started"),
            ComponentStatus::InProgress => write!(f, "in_progress"),
            ComponentStatus::Complete => write!(f, "complete"),
            ComponentStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub status: ComponentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl Component {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ComponentStatus::NotStarted,
            started_at: None,
            ended_at: None,
            failure_reason: None,
            rolled_back_at: None,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }

    fn transition(&mut self, to: ComponentStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (ComponentStatus::NotStarted, ComponentStatus::InProgress)
                | (ComponentStatus::InProgress, ComponentStatus::Complete)
                | (ComponentStatus::InProgress, ComponentStatus::Failed)
        );
        if !allowed {
            return Err(Error::InvalidComponentTransition {
                component: self.name.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// One line of the component status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub name: String,
    pub status: ComponentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub failure_reason: Option<String>,
    pub rolled_back: bool,
}

impl From<&Component> for ComponentSummary {
    fn from(c: &Component) -> Self {
        Self {
            name: c.name.clone(),
            status: c.status,
            started_at: c.started_at,
            ended_at: c.ended_at,
            duration_seconds: c.duration_seconds(),
            failure_reason: c.failure_reason.clone(),
            rolled_back: c.rolled_back_at.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatusReport {
    pub timestamp: DateTime<Utc>,
    pub components: Vec<ComponentSummary>,
}

#[derive(Default)]
struct TrackerState {
    components: HashMap<String, Component>,
    order: Vec<String>,
}

impl TrackerState {
    fn entry(&mut self, name: &str) -> &mut Component {
        if !self.components.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.components
            .entry(name.to_string())
            .or_insert_with(|| Component::new(name))
    }

    fn existing(&mut self, name: &str) -> Result<&mut Component> {
        self.components
            .get_mut(name)
            .ok_or_else(|| Error::ComponentNotFound(name.to_string()))
    }
}

/// Shared record of every component's lifecycle.
///
/// Cloning is cheap and every clone sees the same state.
#[derive(Clone, Default)]
pub struct ComponentTracker {
    state: Arc<RwLock<TrackerState>>,
}

impl ComponentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a component known without starting it. Idempotent.
    pub async fn register(&self, name: &str) {
        let mut state = self.state.write().await;
        state.entry(name);
    }

    pub async fn start_component(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let component = state.entry(name);
        if component.status == ComponentStatus::InProgress {
            return Err(Error::DuplicateComponent(name.to_string()));
        }
        component.transition(ComponentStatus::InProgress)?;
        component.started_at = Some(Utc::now());
        flog!("Component {} started", name);
        Ok(())
    }

    pub async fn complete_component(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let component = state.existing(name)?;
        component.transition(ComponentStatus::Complete)?;
        component.ended_at = Some(Utc::now());
        flog!(
            "Component {} complete in {:.1}s",
            name,
            component.duration_seconds().unwrap_or_default()
        );
        Ok(())
    }

    pub async fn fail_component(&self, name: &str, reason: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let component = state.existing(name)?;
        component.transition(ComponentStatus::Failed)?;
        component.ended_at = Some(Utc::now());
        component.failure_reason = Some(reason.to_string());
        flog!("Component {} failed: {}", name, reason);
        Ok(())
    }

    /// Record that the component's rollback ran. Status is left unchanged.
    pub async fn mark_rolled_back(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let component = state.existing(name)?;
        if component.rolled_back_at.is_none() {
            component.rolled_back_at = Some(Utc::now());
            flog_debug!("Component {} marked rolled back", name);
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Component> {
        self.state.read().await.components.get(name).cloned()
    }

    pub async fn status(&self, name: &str) -> Option<ComponentStatus> {
        self.state
            .read()
            .await
            .components
            .get(name)
            .map(|c| c.status)
    }

    /// All components in registration order.
    pub async fn snapshot(&self) -> Vec<Component> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|name| state.components.get(name).cloned())
            .collect()
    }

    pub async fn generate_status_report(&self) -> ComponentStatusReport {
        let components = self.snapshot().await;
        ComponentStatusReport {
            timestamp: Utc::now(),
            components: components.iter().map(ComponentSummary::from).collect(),
        }
    }
}

impl std::fmt::Debug for ComponentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentTracker").finish_non_exhaustive()
    }
}
