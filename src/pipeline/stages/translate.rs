use regex::Regex;
use std::collections::HashSet;

use crate::error::{HarmonizeError, Result};
use crate::spec::{ColumnReplacements, EntitySpec, ExtraColumn, FillPolicy, ReplacementRule};
use crate::table::{as_number, canonical, EntityTable, Value};

/// Replacement rules per column (declaration order), then renames, then extra columns.
pub fn translate(spec: &EntitySpec, table: &mut EntityTable) -> Result<()> {
    for replacements in &spec.replacements {
        replace_column(&spec.name, replacements, table)?;
    }
    for (from, to) in &spec.translations {
        if !table.rename_column(from, to) {
            return Err(HarmonizeError::stage(
                &spec.name,
                "translate",
                format!("cannot rename missing column '{}' to '{}'", from, to),
            ));
        }
    }
    for extra in &spec.extra_columns {
        add_extra_column(&spec.name, extra, table)?;
    }
    Ok(())
}

fn column_index(entity: &str, table: &EntityTable, column: &str) -> Result<usize> {
    table
        .column_index(column)
        .ok_or_else(|| HarmonizeError::stage(entity, "translate", format!("column '{}' not found", column)))
}

fn replace_column(entity: &str, replacements: &ColumnReplacements, table: &mut EntityTable) -> Result<()> {
    let idx = column_index(entity, table, &replacements.column)?;
    let mut cells: Vec<Value> = table.rows().iter().map(|r| r[idx].clone()).collect();

    for rule in &replacements.rules {
        apply_rule(entity, rule, &mut cells)?;
    }
    for (row, value) in cells.into_iter().enumerate() {
        table.set(row, idx, value);
    }
    Ok(())
}

fn apply_rule(entity: &str, rule: &ReplacementRule, cells: &mut [Value]) -> Result<()> {
    match rule {
        ReplacementRule::Exact { from, to } => {
            let from: HashSet<String> = from.iter().filter_map(canonical).collect();
            for cell in cells.iter_mut() {
                if canonical(cell).is_some_and(|v| from.contains(&v)) {
                    *cell = to.clone();
                }
            }
        }
        ReplacementRule::Pattern { pattern, to } => {
            let regex = Regex::new(pattern)?;
            for cell in cells.iter_mut() {
                if let Value::String(s) = cell {
                    if regex.is_match(s) {
                        *s = regex.replace_all(s, to.as_str()).into_owned();
                    }
                }
            }
        }
        ReplacementRule::Range { min, max, to } => {
            if min.is_none() && max.is_none() {
                return Err(HarmonizeError::stage(entity, "translate", "range rule needs min or max"));
            }
            for cell in cells.iter_mut() {
                let Some(n) = as_number(cell) else { continue };
                let above = min.map_or(true, |m| n >= m);
                let below = max.map_or(true, |m| n < m);
                if above && below {
                    *cell = to.clone();
                }
            }
        }
        ReplacementRule::Blank { values, fill, fill_value } => {
            let blank: HashSet<String> = values.iter().filter_map(canonical).collect();
            for cell in cells.iter_mut() {
                if canonical(cell).is_some_and(|v| blank.contains(&v)) {
                    *cell = Value::Null;
                }
            }
            fill_nulls(entity, *fill, fill_value.as_ref(), cells)?;
        }
        ReplacementRule::Map { mapping } => {
            for cell in cells.iter_mut() {
                if let Some(mapped) = canonical(cell).and_then(|v| mapping.get(&v)) {
                    *cell = mapped.clone();
                }
            }
        }
    }
    Ok(())
}

fn fill_nulls(entity: &str, policy: FillPolicy, fill_value: Option<&Value>, cells: &mut [Value]) -> Result<()> {
    match policy {
        FillPolicy::Null => {}
        FillPolicy::Forward => {
            let mut last: Option<Value> = None;
            for cell in cells.iter_mut() {
                if cell.is_null() {
                    if let Some(previous) = &last {
                        *cell = previous.clone();
                    }
                } else {
                    last = Some(cell.clone());
                }
            }
        }
        FillPolicy::Constant => {
            let value = fill_value.ok_or_else(|| {
                HarmonizeError::stage(entity, "translate", "constant fill requires fill_value")
            })?;
            for cell in cells.iter_mut().filter(|c| c.is_null()) {
                *cell = value.clone();
            }
        }
    }
    Ok(())
}

fn add_extra_column(entity: &str, extra: &ExtraColumn, table: &mut EntityTable) -> Result<()> {
    let values: Vec<Value> = if let Some(from) = &extra.from {
        let idx = column_index(entity, table, from)?;
        table.rows().iter().map(|r| r[idx].clone()).collect()
    } else if !extra.concat.is_empty() {
        let indices: Vec<usize> = extra
            .concat
            .iter()
            .map(|c| column_index(entity, table, c))
            .collect::<Result<_>>()?;
        let separator = extra.separator.as_deref().unwrap_or(" ");
        table
            .rows()
            .iter()
            .map(|r| {
                let parts: Vec<String> = indices.iter().filter_map(|&i| canonical(&r[i])).collect();
                if parts.is_empty() {
                    Value::Null
                } else {
                    Value::String(parts.join(separator))
                }
            })
            .collect()
    } else {
        let constant = extra.value.clone().unwrap_or(Value::Null);
        vec![constant; table.len()]
    };

    let idx = table.ensure_column(&extra.name);
    for (row, value) in values.into_iter().enumerate() {
        table.set(row, idx, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn table(values: &[Value]) -> EntityTable {
        let mut t = EntityTable::new("sample", vec!["depth".to_string(), "site".to_string()]);
        for v in values {
            t.push_row(vec![v.clone(), json!("Uppsala")]);
        }
        t
    }

    fn column(rules: Vec<ReplacementRule>) -> ColumnReplacements {
        ColumnReplacements {
            column: "depth".to_string(),
            rules,
        }
    }

    fn depths(t: &EntityTable) -> Vec<Value> {
        (0..t.len()).map(|r| t.value(r, "depth").cloned().unwrap_or(Value::Null)).collect()
    }

    #[test]
    fn test_rules_apply_in_order() {
        let mut spec = EntitySpec::new("sample", "sample_id");
        spec.replacements.push(column(vec![
            ReplacementRule::Exact {
                from: vec![json!("n/a")],
                to: Value::Null,
            },
            ReplacementRule::Range {
                min: Some(0.0),
                max: Some(10.0),
                to: json!("shallow"),
            },
            ReplacementRule::Pattern {
                pattern: "^(\\d+)cm$".to_string(),
                to: "$1".to_string(),
            },
        ]));

        let mut t = table(&[json!("n/a"), json!(5), json!("40cm")]);
        translate(&spec, &mut t).unwrap();
        assert_eq!(depths(&t), vec![Value::Null, json!("shallow"), json!("40")]);
    }

    #[test]
    fn test_blank_with_forward_fill() {
        let mut spec = EntitySpec::new("sample", "sample_id");
        spec.replacements.push(column(vec![ReplacementRule::Blank {
            values: vec![json!("-")],
            fill: FillPolicy::Forward,
            fill_value: None,
        }]));

        let mut t = table(&[json!(1), json!("-"), Value::Null, json!(4)]);
        translate(&spec, &mut t).unwrap();
        assert_eq!(depths(&t), vec![json!(1), json!(1), json!(1), json!(4)]);
    }

    #[test]
    fn test_map_rename_and_extra_columns() {
        let mut spec = EntitySpec::new("sample", "sample_id");
        let mut mapping = BTreeMap::new();
        mapping.insert("1".to_string(), json!("one"));
        spec.replacements.push(column(vec![ReplacementRule::Map { mapping }]));
        spec.translations.insert("depth".to_string(), "depth_label".to_string());
        spec.extra_columns.push(ExtraColumn {
            name: "label".to_string(),
            from: None,
            value: None,
            concat: vec!["site".to_string(), "depth_label".to_string()],
            separator: Some("/".to_string()),
        });
        spec.extra_columns.push(ExtraColumn {
            name: "source".to_string(),
            from: None,
            value: Some(json!("survey")),
            concat: Vec::new(),
            separator: None,
        });

        let mut t = table(&[json!(1)]);
        translate(&spec, &mut t).unwrap();
        assert_eq!(t.value(0, "depth_label"), Some(&json!("one")));
        assert_eq!(t.value(0, "label"), Some(&json!("Uppsala/one")));
        assert_eq!(t.value(0, "source"), Some(&json!("survey")));
    }

    #[test]
    fn test_rename_of_missing_column_fails() {
        let mut spec = EntitySpec::new("sample", "sample_id");
        spec.translations.insert("nope".to_string(), "x".to_string());
        let err = translate(&spec, &mut table(&[])).unwrap_err();
        assert!(matches!(err, HarmonizeError::Stage { stage: "translate", .. }));
    }
}
