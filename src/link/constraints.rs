//! Constraint evaluation over pre-overwrite match statistics.

use std::collections::{BTreeSet, HashMap};

use crate::issues::{IssueCode, ValidationIssue};
use crate::spec::{Cardinality, ForeignKeySpec};
use crate::table::{composite_key, render_key, EntityTable};

/// Match statistics gathered before the foreign key column is written
#[derive(Debug, Default)]
pub struct MatchProfile {
    /// Composite key per child row; `None` when any part is null
    pub child_keys: Vec<Option<Vec<String>>>,
    /// Parent key to parent system ids, in parent row order
    pub parent_index: HashMap<Vec<String>, Vec<u64>>,
    /// Parent keys in first-seen order
    pub parent_order: Vec<Vec<String>>,
    pub child_counts: HashMap<Vec<String>, usize>,
}

impl MatchProfile {
    pub fn build(table: &EntityTable, local: &[usize], parent: &EntityTable, remote: &[usize]) -> Self {
        let mut profile = MatchProfile::default();

        for (i, values) in parent.rows().iter().enumerate() {
            if let Some(key) = composite_key(remote.iter().map(|&c| &values[c])) {
                let ids = profile.parent_index.entry(key.clone()).or_default();
                if ids.is_empty() {
                    profile.parent_order.push(key);
                }
                ids.push(parent.system_id(i));
            }
        }

        for values in table.rows() {
            let key = composite_key(local.iter().map(|&c| &values[c]));
            if let Some(k) = &key {
                *profile.child_counts.entry(k.clone()).or_default() += 1;
            }
            profile.child_keys.push(key);
        }
        profile
    }

    pub fn parents_for(&self, key: &[String]) -> &[u64] {
        self.parent_index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn null_rows(&self) -> usize {
        self.child_keys.iter().filter(|k| k.is_none()).count()
    }

    /// Child rows with a non-null key and no parent
    pub fn unmatched_left(&self) -> Vec<&Vec<String>> {
        self.child_keys
            .iter()
            .flatten()
            .filter(|k| !self.parent_index.contains_key(*k))
            .collect()
    }

    pub fn matched_rows(&self) -> usize {
        self.child_keys
            .iter()
            .flatten()
            .filter(|k| self.parent_index.contains_key(*k))
            .count()
    }

    /// Parent keys no child row refers to
    pub fn unmatched_right(&self) -> Vec<&Vec<String>> {
        self.parent_order
            .iter()
            .filter(|k| !self.child_counts.contains_key(*k))
            .collect()
    }

    fn duplicate_child_keys(&self) -> Vec<&Vec<String>> {
        let mut seen = BTreeSet::new();
        self.child_keys
            .iter()
            .flatten()
            .filter(|k| self.child_counts[*k] > 1 && seen.insert(*k))
            .collect()
    }

    fn duplicate_parent_keys(&self) -> Vec<&Vec<String>> {
        self.parent_order
            .iter()
            .filter(|k| self.parent_index[*k].len() > 1)
            .collect()
    }

    /// Duplicate parent keys that some child row actually resolves to
    fn ambiguous_matches(&self) -> Vec<&Vec<String>> {
        self.duplicate_parent_keys()
            .into_iter()
            .filter(|k| self.child_counts.contains_key(*k))
            .collect()
    }

    /// Matched child keys occurring on more than one child row
    fn repeated_matched_child_keys(&self) -> Vec<&Vec<String>> {
        self.duplicate_child_keys()
            .into_iter()
            .filter(|k| self.parent_index.contains_key(*k))
            .collect()
    }
}

/// Distinct rendered keys, capped at `limit`, in first-seen order.
pub fn sample_keys<'a>(keys: impl IntoIterator<Item = &'a Vec<String>>, limit: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    keys.into_iter()
        .filter(|k| seen.insert(*k))
        .take(limit)
        .map(|k| render_key(k))
        .collect()
}

fn describe(sample: &[String], total: usize) -> String {
    if total > sample.len() {
        format!("{} (and {} more)", sample.join(", "), total - sample.len())
    } else {
        sample.join(", ")
    }
}

/// Every violated constraint of one foreign key, as error issues.
pub fn evaluate(entity: &str, fk: &ForeignKeySpec, profile: &MatchProfile, sample_limit: usize) -> Vec<ValidationIssue> {
    let constraints = &fk.constraints;
    let field = fk.constraint_key();
    let keys = format!("({})", fk.local_keys.join(", "));
    let mut issues = Vec::new();
    let mut push = |code: IssueCode, message: String, suggestion: &str| {
        issues.push(
            ValidationIssue::error(entity, code, message)
                .with_field(field.clone())
                .with_suggestion(suggestion.to_string()),
        );
    };

    let null_rows = profile.null_rows();
    if null_rows > 0 && !constraints.allow_null_keys {
        push(
            IssueCode::NullKeys,
            format!(
                "{} rows in '{}' have null values in foreign key {} to '{}'",
                null_rows, entity, keys, fk.entity
            ),
            "Fill the key columns or set allow_null_keys = true",
        );
    }

    let dup_left = profile.duplicate_child_keys();
    if constraints.require_unique_left && !dup_left.is_empty() {
        let sample = sample_keys(dup_left.iter().copied(), sample_limit);
        push(
            IssueCode::DuplicateLeftKeys,
            format!(
                "{} duplicate key values in '{}' {}: {}",
                dup_left.len(),
                entity,
                keys,
                describe(&sample, dup_left.len())
            ),
            "Deduplicate the source rows or drop require_unique_left",
        );
    }

    let dup_right = profile.duplicate_parent_keys();
    if constraints.require_unique_right && !dup_right.is_empty() {
        let sample = sample_keys(dup_right.iter().copied(), sample_limit);
        push(
            IssueCode::DuplicateRightKeys,
            format!(
                "{} duplicate key values in parent '{}' ({}): {}",
                dup_right.len(),
                fk.entity,
                fk.remote_keys.join(", "),
                describe(&sample, dup_right.len())
            ),
            "Make the parent keys unique or drop require_unique_right",
        );
    }

    let (ambiguous, repeated) = match constraints.cardinality {
        Cardinality::OneToOne => (profile.ambiguous_matches(), profile.repeated_matched_child_keys()),
        Cardinality::ManyToOne => (profile.ambiguous_matches(), Vec::new()),
        Cardinality::OneToMany => (Vec::new(), profile.repeated_matched_child_keys()),
        Cardinality::ManyToMany => (Vec::new(), Vec::new()),
    };
    if !ambiguous.is_empty() {
        let sample = sample_keys(ambiguous.iter().copied(), sample_limit);
        push(
            IssueCode::CardinalityViolation,
            format!(
                "{:?} link from '{}' to '{}': {} keys resolve to more than one parent row: {}",
                constraints.cardinality,
                entity,
                fk.entity,
                ambiguous.len(),
                describe(&sample, ambiguous.len())
            ),
            "Make the parent keys unique or declare cardinality = \"many_to_many\"",
        );
    }
    if !repeated.is_empty() {
        let sample = sample_keys(repeated.iter().copied(), sample_limit);
        push(
            IssueCode::CardinalityViolation,
            format!(
                "{:?} link from '{}' to '{}': {} parent keys are referenced by more than one row: {}",
                constraints.cardinality,
                entity,
                fk.entity,
                repeated.len(),
                describe(&sample, repeated.len())
            ),
            "Deduplicate the child rows or relax the declared cardinality",
        );
    }

    let unmatched_left = profile.unmatched_left();
    if !constraints.allow_unmatched_left && !unmatched_left.is_empty() {
        let sample = sample_keys(unmatched_left.iter().copied(), sample_limit);
        let distinct = unmatched_left.iter().collect::<BTreeSet<_>>().len();
        push(
            IssueCode::UnmatchedLeft,
            format!(
                "{} rows in '{}' have no match in '{}' on {}: {}",
                unmatched_left.len(),
                entity,
                fk.entity,
                keys,
                describe(&sample, distinct)
            ),
            "Add the missing parent rows, filter the child rows, or set allow_unmatched_left = true",
        );
    }

    let unmatched_right = profile.unmatched_right();
    if !constraints.allow_unmatched_right && !unmatched_right.is_empty() {
        let sample = sample_keys(unmatched_right.iter().copied(), sample_limit);
        push(
            IssueCode::UnmatchedRight,
            format!(
                "{} rows in parent '{}' are not referenced by '{}': {}",
                unmatched_right.len(),
                fk.entity,
                entity,
                describe(&sample, unmatched_right.len())
            ),
            "Set allow_unmatched_right = true if unreferenced parents are expected",
        );
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(entity: &str, names: &[serde_json::Value]) -> EntityTable {
        let mut t = EntityTable::new(entity, vec!["name".to_string()]);
        for n in names {
            t.push_row(vec![n.clone()]);
        }
        t
    }

    fn profile(child: &[serde_json::Value], parent: &[serde_json::Value]) -> MatchProfile {
        MatchProfile::build(&table("sample", child), &[0], &table("site", parent), &[0])
    }

    fn codes(issues: &[ValidationIssue]) -> Vec<IssueCode> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_clean_many_to_one_has_no_issues() {
        let p = profile(&[json!("a"), json!("a"), json!("b")], &[json!("a"), json!("b")]);
        let fk = ForeignKeySpec::new("site", &["name"], &["name"]);
        assert!(evaluate("sample", &fk, &p, 10).is_empty());
        assert_eq!(p.matched_rows(), 3);
    }

    #[test]
    fn test_many_to_one_rejects_ambiguous_parent() {
        let p = profile(&[json!("a")], &[json!("a"), json!("a")]);
        let fk = ForeignKeySpec::new("site", &["name"], &["name"]);
        assert_eq!(codes(&evaluate("sample", &fk, &p, 10)), vec![IssueCode::CardinalityViolation]);
    }

    #[test]
    fn test_one_to_one_rejects_repeated_child_key() {
        let p = profile(&[json!("a"), json!("a")], &[json!("a")]);
        let mut fk = ForeignKeySpec::new("site", &["name"], &["name"]);
        fk.constraints.cardinality = Cardinality::OneToOne;
        assert_eq!(codes(&evaluate("sample", &fk, &p, 10)), vec![IssueCode::CardinalityViolation]);

        fk.constraints.cardinality = Cardinality::ManyToMany;
        assert!(evaluate("sample", &fk, &p, 10).is_empty());
    }

    #[test]
    fn test_null_keys_reported_independently_of_matching() {
        let p = profile(&[json!("a"), serde_json::Value::Null], &[json!("a")]);
        let mut fk = ForeignKeySpec::new("site", &["name"], &["name"]);
        assert_eq!(codes(&evaluate("sample", &fk, &p, 10)), vec![IssueCode::NullKeys]);

        fk.constraints.allow_null_keys = true;
        assert!(evaluate("sample", &fk, &p, 10).is_empty());
    }

    #[test]
    fn test_unmatched_samples_are_capped() {
        let child: Vec<_> = (0..25).map(|i| json!(format!("v{i}"))).collect();
        let p = profile(&child, &[json!("x")]);
        let fk = ForeignKeySpec::new("site", &["name"], &["name"]);
        let issues = evaluate("sample", &fk, &p, 10);
        assert_eq!(issues[0].code, IssueCode::UnmatchedLeft);
        assert!(issues[0].message.contains("v9"));
        assert!(!issues[0].message.contains("v10,"));
        assert!(issues[0].message.contains("and 15 more"));
    }

    #[test]
    fn test_unmatched_right_only_when_disallowed() {
        let p = profile(&[json!("a")], &[json!("a"), json!("b")]);
        let mut fk = ForeignKeySpec::new("site", &["name"], &["name"]);
        assert!(evaluate("sample", &fk, &p, 10).is_empty());

        fk.constraints.allow_unmatched_right = false;
        let issues = evaluate("sample", &fk, &p, 10);
        assert_eq!(codes(&issues), vec![IssueCode::UnmatchedRight]);
        assert!(issues[0].message.contains('b'));
    }

    #[test]
    fn test_uniqueness_requirements() {
        let p = profile(&[json!("a"), json!("a")], &[json!("a"), json!("b"), json!("b")]);
        let mut fk = ForeignKeySpec::new("site", &["name"], &["name"]);
        fk.constraints.cardinality = Cardinality::ManyToMany;
        fk.constraints.require_unique_left = true;
        fk.constraints.require_unique_right = true;
        assert_eq!(
            codes(&evaluate("sample", &fk, &p, 10)),
            vec![IssueCode::DuplicateLeftKeys, IssueCode::DuplicateRightKeys]
        );
    }
}
