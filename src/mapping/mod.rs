//! Mapping registry: accepted external identifiers per local value.
//!
//! Entries are keyed by `(entity, target_field, value)`. Automatic writes come
//! from the reconciler and never touch an entry that carries a human override.
//! Overrides always win and are only replaced by another override.

pub mod in_memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HarmonizeError, Result};

pub use in_memory::InMemoryRegistry;
pub use sqlite::SqliteRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingKey {
    pub entity: String,
    pub target_field: String,
    pub value: String,
}

impl MappingKey {
    pub fn new(entity: impl Into<String>, target_field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            target_field: target_field.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}='{}'", self.entity, self.target_field, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Matched,
    NeedsReview,
    Unmatched,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Matched => "matched",
            MappingStatus::NeedsReview => "needs_review",
            MappingStatus::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = HarmonizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "matched" => Ok(MappingStatus::Matched),
            "needs_review" => Ok(MappingStatus::NeedsReview),
            "unmatched" => Ok(MappingStatus::Unmatched),
            other => Err(HarmonizeError::Registry(format!("unknown mapping status '{}'", other))),
        }
    }
}

/// Best candidate returned by the service, kept for review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub external_id: String,
    pub label: String,
    pub score: f64,
}

/// A human decision on one mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OverrideDecision {
    /// Accept an identifier; `None` accepts the stored candidate
    Accept { external_id: Option<String> },
    /// Reject the proposed candidate
    Reject,
    /// Treat the value as a new local entity
    MarkUnmatched,
}

impl OverrideDecision {
    pub fn action(&self) -> &'static str {
        match self {
            OverrideDecision::Accept { .. } => "accept",
            OverrideDecision::Reject => "reject",
            OverrideDecision::MarkUnmatched => "mark_unmatched",
        }
    }
}

/// Metadata stored with an override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub decision: OverrideDecision,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl HumanDecision {
    pub fn new(decision: OverrideDecision) -> Self {
        Self {
            decision,
            decided_by: None,
            note: None,
            decided_at: Utc::now(),
        }
    }

    pub fn by(mut self, who: impl Into<String>) -> Self {
        self.decided_by = Some(who.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub key: MappingKey,
    /// Set only when `status` is matched
    pub external_id: Option<String>,
    pub status: MappingStatus,
    pub candidate: Option<Candidate>,
    pub is_override: bool,
    pub decision: Option<HumanDecision>,
    pub updated_at: DateTime<Utc>,
}

impl MappingEntry {
    /// Entry produced by automatic classification
    pub fn automatic(key: MappingKey, status: MappingStatus, candidate: Option<Candidate>) -> Self {
        let external_id = match status {
            MappingStatus::Matched => candidate.as_ref().map(|c| c.external_id.clone()),
            _ => None,
        };
        Self {
            key,
            external_id,
            status,
            candidate,
            is_override: false,
            decision: None,
            updated_at: Utc::now(),
        }
    }

    /// Identifier to publish at Store time
    pub fn published_id(&self) -> Option<&str> {
        match self.status {
            MappingStatus::Matched => self.external_id.as_deref(),
            _ => None,
        }
    }

    /// Entries the reconciler must not re-query: matched, or decided by a human
    pub fn is_settled(&self) -> bool {
        self.is_override || self.status == MappingStatus::Matched
    }
}

/// Apply a decision to the current entry (if any), producing the override entry.
pub fn apply_decision(key: &MappingKey, current: Option<&MappingEntry>, decision: HumanDecision) -> Result<MappingEntry> {
    let candidate = current.and_then(|e| e.candidate.clone());
    let (status, external_id) = match &decision.decision {
        OverrideDecision::Accept { external_id: Some(id) } => (MappingStatus::Matched, Some(id.clone())),
        OverrideDecision::Accept { external_id: None } => {
            let id = candidate
                .as_ref()
                .map(|c| c.external_id.clone())
                .ok_or_else(|| {
                    HarmonizeError::Registry(format!("{} has no candidate to accept; give an external id", key))
                })?;
            (MappingStatus::Matched, Some(id))
        }
        OverrideDecision::Reject | OverrideDecision::MarkUnmatched => (MappingStatus::Unmatched, None),
    };

    Ok(MappingEntry {
        key: key.clone(),
        external_id,
        status,
        candidate,
        is_override: true,
        updated_at: decision.decided_at,
        decision: Some(decision),
    })
}

/// Durable keyed store of mappings; writes are serialized per key
#[async_trait]
pub trait MappingRegistry: Send + Sync {
    async fn get(&self, key: &MappingKey) -> Result<Option<MappingEntry>>;

    /// Insert or replace automatic entries, skipping keys held by an override.
    ///
    /// Returns the number of entries written.
    async fn upsert_automatic(&self, entries: Vec<MappingEntry>) -> Result<usize>;

    async fn record_override(&self, key: &MappingKey, decision: HumanDecision) -> Result<MappingEntry>;

    /// All entries for an entity, ordered by field then value
    async fn list(&self, entity: &str) -> Result<Vec<MappingEntry>>;
}
