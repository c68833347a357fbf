use tracing::debug;

use crate::error::{HarmonizeError, Result};
use crate::filters::FrozenTables;
use crate::sources::{positional_records, LoaderRegistry};
use crate::spec::{AppendSpec, EntitySpec};
use crate::table::{EntityTable, Record, Value};

/// Obtain raw rows, assign system ids 1..N in source order and fill the
/// surrogate column.
///
/// Rows come from the entity's loader, or from a frozen table when `source`
/// names another entity. Declared `append` rows follow with the next ids.
pub async fn extract(spec: &EntitySpec, loaders: &LoaderRegistry, frozen: &FrozenTables) -> Result<EntityTable> {
    let mut table = match &spec.source {
        Some(source) => derive_from(spec, source, frozen)?,
        None => {
            let loader = loaders.for_entity(spec).ok_or_else(|| match &spec.loader {
                Some(l) => HarmonizeError::source(&spec.name, format!("no loader registered for kind '{}'", l.kind)),
                None => HarmonizeError::source(&spec.name, "entity has no loader, values or source"),
            })?;
            let records = loader.extract(spec).await?;
            check_columns(spec, &records)?;
            EntityTable::from_records(&spec.name, &spec.columns, records)
        }
    };

    for append in &spec.append {
        append_rows(spec, append, &mut table, frozen)?;
    }
    fill_surrogate(spec, &mut table);
    debug!("Extracted {} rows for '{}'", table.len(), spec.name);
    Ok(table)
}

/// Write each row's system id into the surrogate column.
pub fn fill_surrogate(spec: &EntitySpec, table: &mut EntityTable) {
    let surrogate = table.ensure_column(&spec.surrogate_id);
    for row in 0..table.len() {
        let id = table.system_id(row);
        table.set(row, surrogate, Value::from(id));
    }
}

fn check_columns(spec: &EntitySpec, records: &[Record]) -> Result<()> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    let missing: Vec<&str> = spec
        .columns
        .iter()
        .filter(|c| !first.contains_key(*c))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HarmonizeError::source(
            &spec.name,
            format!("source rows lack declared columns: {}", missing.join(", ")),
        ))
    }
}

fn frozen_table<'a>(spec: &EntitySpec, source: &str, frozen: &'a FrozenTables) -> Result<&'a EntityTable> {
    frozen
        .get(source)
        .map(|t| t.as_ref())
        .ok_or_else(|| HarmonizeError::source(&spec.name, format!("source entity '{}' has not been stored", source)))
}

/// Copy named columns of a frozen table into records.
fn records_from(spec: &EntitySpec, source: &EntityTable, columns: &[String]) -> Result<Vec<Record>> {
    let wanted: Vec<String> = if columns.is_empty() {
        source.columns().to_vec()
    } else {
        columns.to_vec()
    };
    let indices: Vec<(String, usize)> = wanted
        .into_iter()
        .map(|c| {
            source.column_index(&c).map(|i| (c.clone(), i)).ok_or_else(|| {
                HarmonizeError::source(
                    &spec.name,
                    format!("source entity '{}' has no column '{}'", source.entity(), c),
                )
            })
        })
        .collect::<Result<_>>()?;

    Ok(source
        .rows()
        .iter()
        .map(|row| {
            indices
                .iter()
                .map(|(name, idx)| (name.clone(), row[*idx].clone()))
                .collect()
        })
        .collect())
}

fn derive_from(spec: &EntitySpec, source: &str, frozen: &FrozenTables) -> Result<EntityTable> {
    let parent = frozen_table(spec, source, frozen)?;
    let records = records_from(spec, parent, &spec.columns)?;
    let columns = if spec.columns.is_empty() {
        parent.columns().to_vec()
    } else {
        spec.columns.clone()
    };
    Ok(EntityTable::from_records(&spec.name, &columns, records))
}

fn append_rows(spec: &EntitySpec, append: &AppendSpec, table: &mut EntityTable, frozen: &FrozenTables) -> Result<()> {
    let records = match &append.source {
        Some(source) => {
            let parent = frozen_table(spec, source, frozen)?;
            let shared: Vec<String> = table
                .columns()
                .iter()
                .filter(|c| parent.has_column(c))
                .cloned()
                .collect();
            records_from(spec, parent, &shared)?
        }
        None => {
            let columns = if append.columns.is_empty() {
                table.columns().to_vec()
            } else {
                append.columns.clone()
            };
            positional_records(&spec.name, &columns, &append.values)?
        }
    };

    let count = records.len();
    for mut record in records {
        let row = table
            .columns()
            .iter()
            .map(|c| record.remove(c).unwrap_or(Value::Null))
            .collect();
        table.push_row(row);
    }
    debug!("Appended {} rows to '{}'", count, spec.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn method_spec() -> EntitySpec {
        let mut spec = EntitySpec::new("method", "method_id");
        spec.columns = vec!["name".to_string(), "unit".to_string()];
        spec.values = vec![vec![json!("pH"), json!("-")], vec![json!("LOI"), json!("%")]];
        spec
    }

    #[tokio::test]
    async fn test_fixed_values_with_appended_rows() {
        let mut spec = method_spec();
        spec.append.push(AppendSpec {
            source: None,
            values: vec![vec![json!("C14")]],
            columns: vec!["name".to_string()],
        });

        let table = extract(&spec, &LoaderRegistry::with_builtins(), &FrozenTables::new())
            .await
            .unwrap();
        assert_eq!(table.system_ids(), &[1, 2, 3]);
        assert_eq!(table.value(2, "name"), Some(&json!("C14")));
        assert_eq!(table.value(2, "unit"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_derived_entity_reads_frozen_source() {
        let mut sites = EntityTable::new("site", vec!["site_name".to_string(), "region".to_string()]);
        sites.push_row(vec![json!("Uppsala"), json!("Uppland")]);
        sites.push_row(vec![json!("Lund"), json!("Skåne")]);
        let mut frozen = FrozenTables::new();
        frozen.insert("site".to_string(), sites.freeze());

        let mut spec = EntitySpec::new("region", "region_id");
        spec.source = Some("site".to_string());
        spec.columns = vec!["region".to_string()];

        let table = extract(&spec, &LoaderRegistry::with_builtins(), &frozen).await.unwrap();
        assert_eq!(table.columns(), &["region".to_string(), "region_id".to_string()]);
        assert_eq!(table.value(1, "region_id"), Some(&json!(2)));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_entity_without_any_source_fails() {
        let spec = EntitySpec::new("orphan", "orphan_id");
        let err = extract(&spec, &LoaderRegistry::with_builtins(), &FrozenTables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarmonizeError::Source { .. }));
    }
}
