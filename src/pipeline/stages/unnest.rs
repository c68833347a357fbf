use crate::error::{HarmonizeError, Result};
use crate::spec::UnnestSpec;
use crate::table::{EntityTable, Value};

/// Melt `value_vars` into `var_name`/`value_name` pairs.
///
/// Output columns are `id_vars`, then any `keep` column not already listed
/// (foreign key columns written by Link), then the two new columns. Every
/// output row gets a fresh system id.
pub fn unnest(entity: &str, spec: &UnnestSpec, table: &mut EntityTable, keep: &[String]) -> Result<()> {
    let index_of = |name: &str| {
        table.column_index(name).ok_or_else(|| {
            HarmonizeError::stage(entity, "unnest", format!("column '{}' not found", name))
        })
    };

    let mut id_columns: Vec<String> = spec.id_vars.clone();
    for column in keep {
        if !id_columns.contains(column) && !spec.value_vars.contains(column) && table.has_column(column) {
            id_columns.push(column.clone());
        }
    }
    let id_idx: Vec<usize> = id_columns.iter().map(|c| index_of(c)).collect::<Result<_>>()?;
    let value_idx: Vec<usize> = spec.value_vars.iter().map(|c| index_of(c)).collect::<Result<_>>()?;

    let mut rows = Vec::with_capacity(table.len() * spec.value_vars.len());
    for r in 0..table.len() {
        for (var, &v) in spec.value_vars.iter().zip(&value_idx) {
            let row = table.row(r);
            let mut values: Vec<Value> = id_idx.iter().map(|&i| row[i].clone()).collect();
            values.push(Value::String(var.clone()));
            values.push(row[v].clone());
            rows.push(values);
        }
    }
    let rows = rows
        .into_iter()
        .map(|values| (table.allocate_system_id(), values))
        .collect();

    let mut columns = id_columns;
    columns.push(spec.var_name.clone());
    columns.push(spec.value_name.clone());
    table.reshape(columns, rows);
    Ok(())
}
