//! Declarative entity specifications.
//!
//! A project is parsed once per run into a [`ProjectSpec`]; nothing downstream
//! mutates it. Entities keep their declaration order, which the resolver uses
//! to break ties.

pub mod validators;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::table::Value;

/// Complete harmonization project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    #[serde(default)]
    pub project: ProjectInfo,
    #[serde(default)]
    pub options: RunOptionsSpec,
    #[serde(default)]
    pub target: Option<TargetSpec>,
    #[serde(default)]
    pub registry: RegistrySpec,
    #[serde(default)]
    pub service: Option<ServiceSpec>,
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Run-level defaults; the CLI may override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptionsSpec {
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

impl Default for RunOptionsSpec {
    fn default() -> Self {
        Self { stop_on_error: true }
    }
}

/// Where stored entity tables land
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Dispatcher kind, e.g. `csv`
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Mapping registry persistence; no path means an in-memory registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySpec {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// External reconciliation service endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

/// Declarative description of one target entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    /// Local primary key column, filled with the row's system id
    #[serde(default)]
    pub surrogate_id: String,
    /// Business/natural key columns
    #[serde(default)]
    pub keys: Vec<String>,
    /// Final identifier column; defaults to `surrogate_id`
    #[serde(default)]
    pub public_id: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Derive rows from another (already processed) entity
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub loader: Option<LoaderSpec>,
    /// Inline rows for the `fixed` loader, positional against `columns`
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    /// Drop rows whose business keys repeat an earlier row
    #[serde(default)]
    pub drop_duplicates: bool,
    #[serde(default)]
    pub unnest: Option<UnnestSpec>,
    #[serde(default)]
    pub replacements: Vec<ColumnReplacements>,
    /// Column renames, old name to new name
    #[serde(default)]
    pub translations: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_columns: Vec<ExtraColumn>,
    #[serde(default)]
    pub append: Vec<AppendSpec>,
    #[serde(default)]
    pub reconciliation: Option<ReconciliationSpec>,
}

impl EntitySpec {
    /// Minimal entity with the given name and surrogate id column
    pub fn new(name: impl Into<String>, surrogate_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            surrogate_id: surrogate_id.into(),
            keys: Vec::new(),
            public_id: None,
            columns: Vec::new(),
            depends_on: Vec::new(),
            source: None,
            loader: None,
            values: Vec::new(),
            foreign_keys: Vec::new(),
            filters: Vec::new(),
            drop_duplicates: false,
            unnest: None,
            replacements: Vec::new(),
            translations: BTreeMap::new(),
            extra_columns: Vec::new(),
            append: Vec::new(),
            reconciliation: None,
        }
    }

    pub fn public_id(&self) -> &str {
        self.public_id.as_deref().unwrap_or(&self.surrogate_id)
    }

    /// Every entity this one reads from, in first-mention order without duplicates.
    pub fn referenced_entities(&self) -> Vec<&str> {
        let candidates = self
            .depends_on
            .iter()
            .chain(self.foreign_keys.iter().map(|fk| &fk.entity))
            .chain(self.source.iter())
            .chain(self.append.iter().filter_map(|a| a.source.as_ref()))
            .chain(self.filters.iter().filter_map(|f| f.entity.as_ref()));

        let mut refs: Vec<&str> = Vec::new();
        for name in candidates {
            if !refs.contains(&name.as_str()) {
                refs.push(name.as_str());
            }
        }
        refs
    }
}

/// How an entity's raw rows are obtained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderSpec {
    /// Registered loader kind (`csv`, `fixed`, ...)
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// A foreign key from the current entity to an already processed parent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    /// Parent entity name
    pub entity: String,
    pub local_keys: Vec<String>,
    pub remote_keys: Vec<String>,
    #[serde(default)]
    pub join_type: JoinType,
    /// Column receiving the parent's system id; defaults to the parent's public id column
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub constraints: ForeignKeyConstraints,
}

impl ForeignKeySpec {
    pub fn new(entity: impl Into<String>, local_keys: &[&str], remote_keys: &[&str]) -> Self {
        Self {
            entity: entity.into(),
            local_keys: local_keys.iter().map(|k| k.to_string()).collect(),
            remote_keys: remote_keys.iter().map(|k| k.to_string()).collect(),
            join_type: JoinType::default(),
            column: None,
            constraints: ForeignKeyConstraints::default(),
        }
    }

    /// Stable label used as the `field` of link issues
    pub fn constraint_key(&self) -> String {
        format!("fk:{}({})", self.entity, self.local_keys.join(","))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Keep unmatched child rows with a null foreign key
    #[default]
    Left,
    /// Drop unmatched child rows
    Inner,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    #[default]
    ManyToOne,
    OneToMany,
    ManyToMany,
}

/// Constraints checked by the link engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForeignKeyConstraints {
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub allow_unmatched_left: bool,
    #[serde(default = "default_true")]
    pub allow_unmatched_right: bool,
    #[serde(default)]
    pub require_unique_left: bool,
    #[serde(default)]
    pub require_unique_right: bool,
    #[serde(default)]
    pub allow_null_keys: bool,
    #[serde(default)]
    pub allow_row_decrease: bool,
}

impl Default for ForeignKeyConstraints {
    fn default() -> Self {
        Self {
            cardinality: Cardinality::ManyToOne,
            allow_unmatched_left: false,
            allow_unmatched_right: true,
            require_unique_left: false,
            require_unique_right: false,
            allow_null_keys: false,
            allow_row_decrease: false,
        }
    }
}

/// Row-level predicate; `kind` selects a registered filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub kind: String,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub values: Vec<Value>,
    /// Target entity for cross-entity filters
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub remote_column: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Invert the predicate
    #[serde(default)]
    pub negate: bool,
}

/// Wide-to-long reshape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnnestSpec {
    pub id_vars: Vec<String>,
    pub value_vars: Vec<String>,
    pub var_name: String,
    pub value_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnReplacements {
    pub column: String,
    pub rules: Vec<ReplacementRule>,
}

/// One replacement rule; rules for a column run in declaration order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplacementRule {
    Exact {
        from: Vec<Value>,
        to: Value,
    },
    Pattern {
        pattern: String,
        to: String,
    },
    /// Numeric values in `[min, max)` become `to`
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        to: Value,
    },
    /// Listed values are blanked, then filled per policy
    Blank {
        values: Vec<Value>,
        #[serde(default)]
        fill: FillPolicy,
        #[serde(default)]
        fill_value: Option<Value>,
    },
    Map {
        mapping: BTreeMap<String, Value>,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    #[default]
    Null,
    /// Carry the previous non-null value forward
    Forward,
    /// Use `fill_value`
    Constant,
}

/// Derived column added during translate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraColumn {
    pub name: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub concat: Vec<String>,
    #[serde(default)]
    pub separator: Option<String>,
}

/// Extra rows appended after extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendSpec {
    /// Copy rows from another processed entity
    #[serde(default)]
    pub source: Option<String>,
    /// Positional against `columns` (or the entity's columns)
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
    #[serde(default)]
    pub columns: Vec<String>,
}

/// External identity resolution for an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSpec {
    /// Owning entity; filled in from the enclosing entity when omitted
    #[serde(default)]
    pub entity: String,
    pub target_field: String,
    /// Service property id to local column
    #[serde(default)]
    pub property_mappings: BTreeMap<String, String>,
    pub service_type: String,
    #[serde(default = "default_auto_accept")]
    pub auto_accept_threshold: f64,
    #[serde(default = "default_review")]
    pub review_threshold: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl ReconciliationSpec {
    pub fn new(entity: &str, target_field: &str, service_type: &str) -> Self {
        Self {
            entity: entity.to_string(),
            target_field: target_field.to_string(),
            property_mappings: BTreeMap::new(),
            service_type: service_type.to_string(),
            auto_accept_threshold: default_auto_accept(),
            review_threshold: default_review(),
            batch_size: default_batch_size(),
            max_candidates: default_max_candidates(),
        }
    }
}

impl ProjectSpec {
    pub fn new(entities: Vec<EntitySpec>) -> Self {
        let mut spec = Self {
            project: ProjectInfo::default(),
            options: RunOptionsSpec::default(),
            target: None,
            registry: RegistrySpec::default(),
            service: None,
            entities,
        };
        spec.normalize();
        spec
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }

    /// Fill fields that default from their enclosing entity.
    pub(crate) fn normalize(&mut self) {
        for entity in &mut self.entities {
            if let Some(recon) = &mut entity.reconciliation {
                if recon.entity.is_empty() {
                    recon.entity = entity.name.clone();
                }
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

fn default_auto_accept() -> f64 {
    95.0
}

fn default_review() -> f64 {
    80.0
}

fn default_batch_size() -> usize {
    10
}

fn default_max_candidates() -> usize {
    3
}
