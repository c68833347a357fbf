//! Link stage: resolve foreign keys against frozen parent tables.
//!
//! For every foreign key the engine indexes the parent on `remote_keys`, looks
//! up each child row on `local_keys` and writes the parent's `system_id` into
//! the foreign key column. Constraints are evaluated on the statistics gathered
//! before that column is written. Violations come back as issues; whether they
//! stop the run is the orchestrator's decision.

pub mod constraints;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{HarmonizeError, Result};
use crate::filters::FrozenTables;
use crate::issues::{IssueCode, ValidationIssue};
use crate::observability::link as metrics;
use crate::spec::{EntitySpec, ForeignKeySpec, JoinType, ProjectSpec};
use crate::table::{EntityTable, Value};

pub use constraints::{evaluate, MatchProfile};

/// Offending values listed per issue
pub const DEFAULT_SAMPLE_LIMIT: usize = 10;

/// Counts for one resolved foreign key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Constraint key, e.g. `fk:site(site_name)`
    pub foreign_key: String,
    pub parent: String,
    pub column: String,
    pub rows_before: usize,
    pub rows_after: usize,
    pub matched: usize,
    pub unmatched_left: usize,
    pub unmatched_right: usize,
    pub null_keys: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LinkOutcome {
    pub stats: Vec<LinkStats>,
    pub issues: Vec<ValidationIssue>,
}

impl LinkOutcome {
    pub fn has_errors(&self) -> bool {
        crate::issues::has_errors(&self.issues)
    }
}

/// Column a foreign key writes: explicit `column`, else the parent's public id column.
pub fn fk_column(project: &ProjectSpec, fk: &ForeignKeySpec) -> String {
    fk.column
        .clone()
        .or_else(|| project.entity(&fk.entity).map(|p| p.public_id().to_string()))
        .unwrap_or_else(|| format!("{}_id", fk.entity))
}

#[derive(Debug, Clone)]
pub struct LinkEngine {
    sample_limit: usize,
}

impl Default for LinkEngine {
    fn default() -> Self {
        Self {
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }
}

impl LinkEngine {
    pub fn new(sample_limit: usize) -> Self {
        Self {
            sample_limit: sample_limit.max(1),
        }
    }

    /// Resolve every foreign key of `spec` in declaration order.
    ///
    /// The stage starts from the filtered row count. Each key is checked for
    /// row decrease against the count it was handed, so a drop allowed on one
    /// key is never charged to the next.
    pub fn link_all(
        &self,
        project: &ProjectSpec,
        spec: &EntitySpec,
        table: &mut EntityTable,
        frozen: &FrozenTables,
    ) -> Result<LinkOutcome> {
        let mut outcome = LinkOutcome::default();

        for fk in &spec.foreign_keys {
            let parent = frozen.get(&fk.entity).ok_or_else(|| {
                HarmonizeError::stage(
                    &spec.name,
                    "link",
                    format!("parent '{}' has not been stored yet", fk.entity),
                )
            })?;
            let column = fk_column(project, fk);

            let (stats, mut issues) = self.link(&spec.name, fk, &column, table, parent);

            if stats.rows_after < stats.rows_before && !fk.constraints.allow_row_decrease {
                issues.push(
                    ValidationIssue::error(
                        &spec.name,
                        IssueCode::RowDecrease,
                        format!(
                            "Linking '{}' to '{}' reduced rows from {} to {}",
                            spec.name,
                            fk.entity,
                            stats.rows_before,
                            stats.rows_after
                        ),
                    )
                    .with_field(fk.constraint_key())
                    .with_suggestion("Use join_type = \"left\" or set allow_row_decrease = true"),
                );
            }

            if !issues.is_empty() {
                warn!("⚠️ {} constraint issues on {}", issues.len(), fk.constraint_key());
                metrics::violations(issues.len());
            }
            outcome.stats.push(stats);
            outcome.issues.extend(issues);
        }
        Ok(outcome)
    }

    /// Resolve one foreign key and write `column`; returns stats and violations.
    pub fn link(
        &self,
        entity: &str,
        fk: &ForeignKeySpec,
        column: &str,
        table: &mut EntityTable,
        parent: &EntityTable,
    ) -> (LinkStats, Vec<ValidationIssue>) {
        let mut stats = LinkStats {
            foreign_key: fk.constraint_key(),
            parent: fk.entity.clone(),
            column: column.to_string(),
            rows_before: table.len(),
            rows_after: table.len(),
            ..Default::default()
        };

        let mut issues = Vec::new();
        let local = resolve_columns(entity, entity, &fk.local_keys, table, fk, &mut issues);
        let remote = resolve_columns(entity, &fk.entity, &fk.remote_keys, parent, fk, &mut issues);
        let (Some(local), Some(remote)) = (local, remote) else {
            return (stats, issues);
        };
        if local.len() != remote.len() {
            issues.push(
                ValidationIssue::error(
                    entity,
                    IssueCode::KeyLengthMismatch,
                    format!(
                        "Foreign key to '{}' pairs {} local keys with {} remote keys",
                        fk.entity,
                        local.len(),
                        remote.len()
                    ),
                )
                .with_field(fk.constraint_key()),
            );
            return (stats, issues);
        }

        let profile = MatchProfile::build(table, &local, parent, &remote);
        stats.matched = profile.matched_rows();
        stats.unmatched_left = profile.unmatched_left().len();
        stats.unmatched_right = profile.unmatched_right().len();
        stats.null_keys = profile.null_rows();
        issues.extend(evaluate(entity, fk, &profile, self.sample_limit));

        self.apply(fk, column, table, &profile);
        stats.rows_after = table.len();
        metrics::foreign_key_resolved(stats.matched, stats.unmatched_left + stats.null_keys);
        debug!(
            "Linked '{}' to '{}': {} matched, {} unmatched, {} null, {} -> {} rows",
            entity, fk.entity, stats.matched, stats.unmatched_left, stats.null_keys, stats.rows_before, stats.rows_after
        );
        (stats, issues)
    }

    /// Write parent system ids. A key with several parents expands the row;
    /// copies after the first get fresh system ids. Unmatched rows stay with a
    /// null id on a left join and are dropped on an inner join.
    fn apply(&self, fk: &ForeignKeySpec, column: &str, table: &mut EntityTable, profile: &MatchProfile) {
        let fk_idx = table.ensure_column(column);
        let mut rows = Vec::with_capacity(table.len());

        for (i, key) in profile.child_keys.iter().enumerate() {
            let parents = key.as_deref().map(|k| profile.parents_for(k)).unwrap_or(&[]);
            let values = table.row(i).to_vec();
            match parents {
                [] => {
                    if fk.join_type == JoinType::Left {
                        let mut values = values;
                        values[fk_idx] = Value::Null;
                        rows.push((table.system_id(i), values));
                    }
                }
                [first, rest @ ..] => {
                    let mut values = values;
                    values[fk_idx] = Value::from(*first);
                    for parent_id in rest {
                        let mut copy = values.clone();
                        copy[fk_idx] = Value::from(*parent_id);
                        rows.push((table.allocate_system_id(), copy));
                    }
                    rows.insert(rows.len() - rest.len(), (table.system_id(i), values));
                }
            }
        }
        table.replace_rows(rows);
    }
}

fn resolve_columns(
    entity: &str,
    owner: &str,
    names: &[String],
    table: &EntityTable,
    fk: &ForeignKeySpec,
    issues: &mut Vec<ValidationIssue>,
) -> Option<Vec<usize>> {
    let mut indices = Vec::with_capacity(names.len());
    let mut complete = true;
    for name in names {
        match table.column_index(name) {
            Some(idx) => indices.push(idx),
            None => {
                complete = false;
                issues.push(
                    ValidationIssue::error(
                        entity,
                        IssueCode::MissingColumn,
                        format!("Column '{}' not found in '{}' for foreign key to '{}'", name, owner, fk.entity),
                    )
                    .with_field(fk.constraint_key())
                    .with_suggestion(format!("Available columns: {}", table.columns().join(", "))),
                );
            }
        }
    }
    complete.then_some(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sites(names: &[&str]) -> EntityTable {
        let mut t = EntityTable::new("site", vec!["site_name".to_string(), "site_id".to_string()]);
        for (i, n) in names.iter().enumerate() {
            t.push_row(vec![json!(n), json!(i as u64 + 1)]);
        }
        t
    }

    fn samples(rows: &[(&str, &str)]) -> EntityTable {
        let mut t = EntityTable::new("sample", vec!["site_name".to_string(), "sample_name".to_string()]);
        for (site, sample) in rows {
            t.push_row(vec![json!(site), json!(sample)]);
        }
        t
    }

    fn project() -> ProjectSpec {
        let mut sample = EntitySpec::new("sample", "sample_id");
        sample
            .foreign_keys
            .push(ForeignKeySpec::new("site", &["site_name"], &["site_name"]));
        ProjectSpec::new(vec![EntitySpec::new("site", "site_id"), sample])
    }

    fn frozen(site: EntityTable) -> FrozenTables {
        let mut map = FrozenTables::new();
        map.insert("site".to_string(), site.freeze());
        map
    }

    #[test]
    fn test_unmatched_child_is_reported_and_kept_null() {
        let project = project();
        let spec = project.entity("sample").unwrap();
        let mut table = samples(&[("Uppsala", "core-1"), ("Lund", "core-2")]);

        let outcome = LinkEngine::default()
            .link_all(&project, spec, &mut table, &frozen(sites(&["Uppsala"])))
            .unwrap();

        assert_eq!(table.value(0, "site_id"), Some(&json!(1)));
        assert_eq!(table.value(1, "site_id"), Some(&Value::Null));
        assert_eq!(outcome.issues.len(), 1);
        let issue = &outcome.issues[0];
        assert_eq!(issue.code, IssueCode::UnmatchedLeft);
        assert_eq!(issue.field.as_deref(), Some("fk:site(site_name)"));
        assert!(issue.message.contains("Lund"));
        assert_eq!(outcome.stats[0].matched, 1);
    }

    #[test]
    fn test_inner_join_drop_is_a_row_decrease() {
        let mut project = project();
        project.entities[1].foreign_keys[0].join_type = JoinType::Inner;
        project.entities[1].foreign_keys[0].constraints.allow_unmatched_left = true;
        let spec = project.entity("sample").unwrap().clone();
        let mut table = samples(&[("Uppsala", "core-1"), ("Lund", "core-2")]);

        let outcome = LinkEngine::default()
            .link_all(&project, &spec, &mut table, &frozen(sites(&["Uppsala"])))
            .unwrap();

        assert_eq!(table.len(), 1);
        let codes: Vec<IssueCode> = outcome.issues.iter().map(|i| i.code).collect();
        assert_eq!(codes, vec![IssueCode::RowDecrease]);
    }

    #[test]
    fn test_allowed_drop_is_not_charged_to_the_next_key() {
        let mut project = project();
        {
            let site_fk = &mut project.entities[1].foreign_keys[0];
            site_fk.join_type = JoinType::Inner;
            site_fk.constraints.allow_unmatched_left = true;
            site_fk.constraints.allow_row_decrease = true;
        }
        project.entities[1]
            .foreign_keys
            .push(ForeignKeySpec::new("method", &["method_name"], &["method_name"]));
        project.entities.push(EntitySpec::new("method", "method_id"));
        let spec = project.entity("sample").unwrap().clone();

        let mut table = EntityTable::new("sample", vec!["site_name".to_string(), "method_name".to_string()]);
        table.push_row(vec![json!("Uppsala"), json!("pH")]);
        table.push_row(vec![json!("Lund"), json!("pH")]);

        let mut methods = EntityTable::new("method", vec!["method_name".to_string(), "method_id".to_string()]);
        methods.push_row(vec![json!("pH"), json!(1)]);
        let mut tables = frozen(sites(&["Uppsala"]));
        tables.insert("method".to_string(), methods.freeze());

        let outcome = LinkEngine::default()
            .link_all(&project, &spec, &mut table, &tables)
            .unwrap();

        assert_eq!(table.len(), 1);
        assert!(outcome.issues.is_empty(), "{:?}", outcome.issues);
        assert_eq!(outcome.stats[0].rows_before, 2);
        assert_eq!(outcome.stats[0].rows_after, 1);
        assert_eq!(outcome.stats[1].rows_before, 1);
        assert_eq!(outcome.stats[1].rows_after, 1);
    }

    #[test]
    fn test_many_to_many_expands_with_fresh_ids() {
        let mut fk = ForeignKeySpec::new("site", &["site_name"], &["site_name"]);
        fk.constraints.cardinality = crate::spec::Cardinality::ManyToMany;
        let mut table = samples(&[("Uppsala", "core-1"), ("Lund", "core-2")]);
        let parent = sites(&["Uppsala", "Uppsala", "Lund"]);

        let (stats, issues) = LinkEngine::default().link("sample", &fk, "site_id", &mut table, &parent);

        assert!(issues.is_empty());
        assert_eq!(stats.rows_after, 3);
        assert_eq!(table.system_ids(), &[1, 3, 2]);
        assert_eq!(table.value(0, "site_id"), Some(&json!(1)));
        assert_eq!(table.value(1, "site_id"), Some(&json!(2)));
        assert_eq!(table.value(2, "site_id"), Some(&json!(3)));
    }

    #[test]
    fn test_missing_columns_are_issues_not_panics() {
        let fk = ForeignKeySpec::new("site", &["nope"], &["site_name"]);
        let mut table = samples(&[("Uppsala", "core-1")]);
        let (_, issues) = LinkEngine::default().link("sample", &fk, "site_id", &mut table, &sites(&["Uppsala"]));
        assert_eq!(issues[0].code, IssueCode::MissingColumn);
        assert!(!table.has_column("site_id"));
    }

    #[test]
    fn test_missing_parent_table_is_stage_error() {
        let project = project();
        let spec = project.entity("sample").unwrap();
        let err = LinkEngine::default()
            .link_all(&project, spec, &mut samples(&[]), &FrozenTables::new())
            .unwrap_err();
        assert!(matches!(err, HarmonizeError::Stage { stage: "link", .. }));
    }
}
