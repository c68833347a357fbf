//! Row-level filters applied during the Filter stage.
//!
//! Filters are registered by kind. Each one returns a keep-mask over the
//! table; the registry applies `negate` so individual filters never see it.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{HarmonizeError, Result};
use crate::spec::{EntitySpec, FilterSpec};
use crate::table::{canonical, EntityTable, FrozenTable};

/// Frozen tables a filter may read, keyed by entity name
pub type FrozenTables = HashMap<String, FrozenTable>;

pub trait RowFilter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// `true` for every row that passes.
    fn evaluate(&self, filter: &FilterSpec, table: &EntityTable, frozen: &FrozenTables) -> Result<Vec<bool>>;
}

/// Registered row filters
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn RowFilter>>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ValueFilter::new("equals", false)));
        registry.register(Arc::new(ValueFilter::new("not_equals", true)));
        registry.register(Arc::new(ValueFilter::new("in", false)));
        registry.register(Arc::new(ValueFilter::new("not_in", true)));
        registry.register(Arc::new(NullFilter::new("is_null", true)));
        registry.register(Arc::new(NullFilter::new("not_null", false)));
        registry.register(Arc::new(PatternFilter));
        registry.register(Arc::new(ExistsInFilter));
        registry
    }

    pub fn register(&mut self, filter: Arc<dyn RowFilter>) {
        self.filters.insert(filter.kind().to_string(), filter);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn RowFilter>> {
        self.filters.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.filters.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Apply every declared filter in order; returns the number of rows removed.
    pub fn apply(&self, spec: &EntitySpec, table: &mut EntityTable, frozen: &FrozenTables) -> Result<usize> {
        let before = table.len();
        for filter in &spec.filters {
            let handler = self.get(&filter.kind).ok_or_else(|| {
                HarmonizeError::stage(&spec.name, "filter", format!("unknown filter kind '{}'", filter.kind))
            })?;
            let mut keep = handler.evaluate(filter, table, frozen)?;
            if filter.negate {
                keep.iter_mut().for_each(|k| *k = !*k);
            }
            table.retain_rows(&keep);
            debug!("Filter '{}' on '{}' kept {} rows", filter.kind, spec.name, table.len());
        }
        Ok(before - table.len())
    }
}

fn required_column<'a>(filter: &'a FilterSpec, table: &EntityTable) -> Result<(&'a str, usize)> {
    let column = filter.column.as_deref().ok_or_else(|| {
        HarmonizeError::stage(table.entity(), "filter", format!("filter '{}' requires a column", filter.kind))
    })?;
    let idx = table.column_index(column).ok_or_else(|| {
        HarmonizeError::stage(
            table.entity(),
            "filter",
            format!("filter '{}' references missing column '{}'", filter.kind, column),
        )
    })?;
    Ok((column, idx))
}

/// `equals`/`in` and their inverted forms; compares canonical values
pub struct ValueFilter {
    kind: &'static str,
    invert: bool,
}

impl ValueFilter {
    pub fn new(kind: &'static str, invert: bool) -> Self {
        Self { kind, invert }
    }
}

impl RowFilter for ValueFilter {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn evaluate(&self, filter: &FilterSpec, table: &EntityTable, _frozen: &FrozenTables) -> Result<Vec<bool>> {
        let (_, idx) = required_column(filter, table)?;
        let wanted: HashSet<String> = filter.values.iter().filter_map(canonical).collect();
        Ok(table
            .rows()
            .iter()
            .map(|row| {
                let hit = canonical(&row[idx]).map(|v| wanted.contains(&v)).unwrap_or(false);
                hit != self.invert
            })
            .collect())
    }
}

pub struct NullFilter {
    kind: &'static str,
    keep_null: bool,
}

impl NullFilter {
    pub fn new(kind: &'static str, keep_null: bool) -> Self {
        Self { kind, keep_null }
    }
}

impl RowFilter for NullFilter {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn evaluate(&self, filter: &FilterSpec, table: &EntityTable, _frozen: &FrozenTables) -> Result<Vec<bool>> {
        let (_, idx) = required_column(filter, table)?;
        Ok(table
            .rows()
            .iter()
            .map(|row| row[idx].is_null() == self.keep_null)
            .collect())
    }
}

/// Regular expression match against the canonical text of a cell
pub struct PatternFilter;

impl RowFilter for PatternFilter {
    fn kind(&self) -> &'static str {
        "pattern"
    }

    fn evaluate(&self, filter: &FilterSpec, table: &EntityTable, _frozen: &FrozenTables) -> Result<Vec<bool>> {
        let (_, idx) = required_column(filter, table)?;
        let pattern = filter.pattern.as_deref().ok_or_else(|| {
            HarmonizeError::stage(table.entity(), "filter", "pattern filter requires a pattern")
        })?;
        let regex = Regex::new(pattern)?;
        Ok(table
            .rows()
            .iter()
            .map(|row| canonical(&row[idx]).map(|v| regex.is_match(&v)).unwrap_or(false))
            .collect())
    }
}

/// Keep rows whose value exists in a column of an already frozen entity
pub struct ExistsInFilter;

impl RowFilter for ExistsInFilter {
    fn kind(&self) -> &'static str {
        "exists_in"
    }

    fn evaluate(&self, filter: &FilterSpec, table: &EntityTable, frozen: &FrozenTables) -> Result<Vec<bool>> {
        let (column, idx) = required_column(filter, table)?;
        let target = filter.entity.as_deref().ok_or_else(|| {
            HarmonizeError::stage(table.entity(), "filter", "exists_in filter requires an entity")
        })?;
        let parent = frozen.get(target).ok_or_else(|| {
            HarmonizeError::stage(
                table.entity(),
                "filter",
                format!("exists_in target '{}' has not been processed", target),
            )
        })?;
        let remote = filter.remote_column.as_deref().unwrap_or(column);
        let remote_idx = parent.column_index(remote).ok_or_else(|| {
            HarmonizeError::stage(
                table.entity(),
                "filter",
                format!("entity '{}' has no column '{}'", target, remote),
            )
        })?;

        let present: HashSet<String> = parent
            .rows()
            .iter()
            .filter_map(|row| canonical(&row[remote_idx]))
            .collect();
        Ok(table
            .rows()
            .iter()
            .map(|row| canonical(&row[idx]).map(|v| present.contains(&v)).unwrap_or(false))
            .collect())
    }
}
