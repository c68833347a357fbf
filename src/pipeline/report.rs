use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::dispatch::StoreAck;
use crate::issues::{has_errors, Severity, ValidationIssue};
use crate::link::LinkStats;
use crate::reconcile::ReconcileOutcome;
use crate::table::FrozenTable;

/// Per-entity state machine; `Failed` and `Skipped` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Pending,
    Extracting,
    Filtering,
    Linking,
    Unnesting,
    Translating,
    Reconciling,
    Storing,
    Completed,
    Failed,
    Skipped,
}

impl EntityState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntityState::Completed | EntityState::Failed | EntityState::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::Pending => "pending",
            EntityState::Extracting => "extracting",
            EntityState::Filtering => "filtering",
            EntityState::Linking => "linking",
            EntityState::Unnesting => "unnesting",
            EntityState::Translating => "translating",
            EntityState::Reconciling => "reconciling",
            EntityState::Storing => "storing",
            EntityState::Completed => "completed",
            EntityState::Failed => "failed",
            EntityState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Dispatch tables and query the reconciliation service
    Execute,
    /// Run every stage without side effects and collect all issues
    Validate,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub name: String,
    pub state: EntityState,
    /// Stage the entity was in when it failed
    pub failed_stage: Option<EntityState>,
    pub rows_extracted: usize,
    pub rows_final: usize,
    pub link: Vec<LinkStats>,
    pub reconciliation: Option<ReconcileOutcome>,
    pub ack: Option<StoreAck>,
    pub duration_ms: u64,
}

impl EntityReport {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: EntityState::Pending,
            failed_stage: None,
            rows_extracted: 0,
            rows_final: 0,
            link: Vec::new(),
            reconciliation: None,
            ack: None,
            duration_ms: 0,
        }
    }
}

/// Result of one run over a project
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub project: String,
    pub mode: RunMode,
    /// Resolved processing order
    pub order: Vec<String>,
    /// Entities in processing order
    pub entities: Vec<EntityReport>,
    pub issues: Vec<ValidationIssue>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Frozen tables of every entity that reached Store
    #[serde(skip)]
    pub tables: HashMap<String, FrozenTable>,
}

impl RunReport {
    pub fn new(project: &str, mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project: project.to_string(),
            mode,
            order: Vec::new(),
            entities: Vec::new(),
            issues: Vec::new(),
            cancelled: false,
            started_at: Utc::now(),
            completed_at: None,
            tables: HashMap::new(),
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_mut(&mut self, name: &str) -> Option<&mut EntityReport> {
        self.entities.iter_mut().find(|e| e.name == name)
    }

    pub fn state(&self, name: &str) -> Option<EntityState> {
        self.entity(name).map(|e| e.state)
    }

    pub fn table(&self, name: &str) -> Option<&FrozenTable> {
        self.tables.get(name)
    }

    pub fn has_errors(&self) -> bool {
        has_errors(&self.issues)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    /// No errors, nothing failed or skipped, not cancelled
    pub fn success(&self) -> bool {
        !self.cancelled
            && !self.has_errors()
            && self.entities.iter().all(|e| e.state == EntityState::Completed)
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    pub fn count(&self, state: EntityState) -> usize {
        self.entities.iter().filter(|e| e.state == state).count()
    }
}
