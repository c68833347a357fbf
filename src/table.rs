//! In-memory tabular result for one entity.
//!
//! Every row carries a run-unique `system_id`. Ids are handed out by the table's
//! own counter, so rows created after extraction (link expansion, unnest) get
//! fresh ids and no id is ever reused within a run.

use std::collections::HashMap;
use std::sync::Arc;

pub type Value = serde_json::Value;

/// Column-keyed record as produced by a source loader
pub type Record = HashMap<String, Value>;

/// A table that finished its pipeline and may be read by dependents
pub type FrozenTable = Arc<EntityTable>;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityTable {
    entity: String,
    columns: Vec<String>,
    system_ids: Vec<u64>,
    rows: Vec<Vec<Value>>,
    next_system_id: u64,
}

impl EntityTable {
    pub fn new(entity: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            entity: entity.into(),
            columns,
            system_ids: Vec::new(),
            rows: Vec::new(),
            next_system_id: 1,
        }
    }

    /// Build a table from source records, assigning system ids 1..N in record order.
    ///
    /// Columns missing from a record are null; record keys not in `columns` are dropped
    /// unless `columns` is empty, in which case the first record's keys (sorted) are used.
    pub fn from_records(entity: impl Into<String>, columns: &[String], records: Vec<Record>) -> Self {
        let columns: Vec<String> = if columns.is_empty() {
            let mut inferred: Vec<String> = records
                .first()
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default();
            inferred.sort();
            inferred
        } else {
            columns.to_vec()
        };

        let mut table = Self::new(entity, columns);
        for mut record in records {
            let row = table
                .columns
                .iter()
                .map(|c| record.remove(c).unwrap_or(Value::Null))
                .collect();
            table.push_row(row);
        }
        table
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn system_ids(&self) -> &[u64] {
        &self.system_ids
    }

    pub fn system_id(&self, row: usize) -> u64 {
        self.system_ids[row]
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row(&self, row: usize) -> &[Value] {
        &self.rows[row]
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Row index holding the given system id
    pub fn find_system_id(&self, system_id: u64) -> Option<usize> {
        self.system_ids.iter().position(|id| *id == system_id)
    }

    /// Add a null-filled column if it does not exist; returns its index.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        self.columns.len() - 1
    }

    pub fn set(&mut self, row: usize, column: usize, value: Value) {
        self.rows[row][column] = value;
    }

    pub fn rename_column(&mut self, old: &str, new: &str) -> bool {
        match self.column_index(old) {
            Some(idx) => {
                self.columns[idx] = new.to_string();
                true
            }
            None => false,
        }
    }

    /// Hand out the next unused system id.
    pub fn allocate_system_id(&mut self) -> u64 {
        let id = self.next_system_id;
        self.next_system_id += 1;
        id
    }

    /// Append a row, assigning it a fresh system id.
    pub fn push_row(&mut self, values: Vec<Value>) -> u64 {
        debug_assert_eq!(values.len(), self.columns.len());
        let id = self.allocate_system_id();
        self.system_ids.push(id);
        self.rows.push(values);
        id
    }

    /// Keep rows where `keep[i]` is true.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        let mut idx = 0;
        self.rows.retain(|_| {
            let k = keep.get(idx).copied().unwrap_or(true);
            idx += 1;
            k
        });
        let mut idx = 0;
        self.system_ids.retain(|_| {
            let k = keep.get(idx).copied().unwrap_or(true);
            idx += 1;
            k
        });
    }

    /// Replace the full row set with already identified rows.
    ///
    /// Ids must come from this table's own allocator.
    pub fn replace_rows(&mut self, rows: Vec<(u64, Vec<Value>)>) {
        let (ids, values): (Vec<u64>, Vec<Vec<Value>>) = rows.into_iter().unzip();
        self.system_ids = ids;
        self.rows = values;
    }

    /// Replace columns and rows in one go (used by reshaping stages).
    pub fn reshape(&mut self, columns: Vec<String>, rows: Vec<(u64, Vec<Value>)>) {
        self.columns = columns;
        self.replace_rows(rows);
    }

    pub fn freeze(self) -> FrozenTable {
        Arc::new(self)
    }
}

/// Canonical string form used for key comparison; `None` for null.
///
/// Integral floats compare equal to integers so that `1` from a spreadsheet and
/// `1.0` from a CSV parse match.
pub fn canonical(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some((f as i64).to_string())
                } else {
                    Some(f.to_string())
                }
            } else {
                Some(n.to_string())
            }
        }
        other => Some(other.to_string()),
    }
}

/// Composite key over several cells; `None` if any part is null.
pub fn composite_key<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<Vec<String>> {
    values.into_iter().map(canonical).collect()
}

/// Human-readable rendering of a key, used in issue samples.
pub fn render_key(parts: &[String]) -> String {
    if parts.len() == 1 {
        parts[0].clone()
    } else {
        format!("({})", parts.join(", "))
    }
}

/// Numeric view of a cell, parsing numeric strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
