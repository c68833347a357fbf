use std::collections::HashSet;
use tracing::debug;

use crate::error::{HarmonizeError, Result};
use crate::filters::{FilterRegistry, FrozenTables};
use crate::spec::EntitySpec;
use crate::table::{canonical, EntityTable};

/// Apply declared filters, then `drop_duplicates`. Returns rows removed.
pub fn filter(spec: &EntitySpec, table: &mut EntityTable, filters: &FilterRegistry, frozen: &FrozenTables) -> Result<usize> {
    let mut removed = filters.apply(spec, table, frozen)?;
    if spec.drop_duplicates {
        removed += drop_duplicates(spec, table)?;
    }
    Ok(removed)
}

/// Keep the first row of each business key. Without declared keys every
/// column except the surrogate takes part.
fn drop_duplicates(spec: &EntitySpec, table: &mut EntityTable) -> Result<usize> {
    let indices: Vec<usize> = if spec.keys.is_empty() {
        (0..table.columns().len())
            .filter(|&i| table.columns()[i] != spec.surrogate_id)
            .collect()
    } else {
        spec.keys
            .iter()
            .map(|k| {
                table.column_index(k).ok_or_else(|| {
                    HarmonizeError::stage(&spec.name, "filter", format!("key column '{}' not found", k))
                })
            })
            .collect::<Result<_>>()?
    };

    let mut seen = HashSet::new();
    let keep: Vec<bool> = table
        .rows()
        .iter()
        .map(|row| {
            let key: Vec<Option<String>> = indices.iter().map(|&i| canonical(&row[i])).collect();
            seen.insert(key)
        })
        .collect();
    let before = table.len();
    table.retain_rows(&keep);
    let removed = before - table.len();
    if removed > 0 {
        debug!("Dropped {} duplicate rows from '{}'", removed, spec.name);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_drop_duplicates_keeps_first_by_key() {
        let mut spec = EntitySpec::new("site", "site_id");
        spec.keys = vec!["site_name".to_string()];
        spec.drop_duplicates = true;

        let mut table = EntityTable::new("site", vec!["site_name".to_string(), "note".to_string()]);
        table.push_row(vec![json!("Uppsala"), json!("a")]);
        table.push_row(vec![json!("Uppsala"), json!("b")]);
        table.push_row(vec![json!("Lund"), json!("c")]);

        let removed = filter(&spec, &mut table, &FilterRegistry::with_builtins(), &FrozenTables::new()).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(table.system_ids(), &[1, 3]);
    }
}
