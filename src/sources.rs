//! Source collaborators.
//!
//! A loader turns an entity specification into an ordered list of records. The
//! engine only relies on a stable row order and on the declared columns being
//! present; connection handling and format parsing belong to the loader.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::{HarmonizeError, Result};
use crate::spec::EntitySpec;
use crate::table::{Record, Value};

#[async_trait]
pub trait SourceLoader: Send + Sync {
    /// Registered kind name, e.g. `csv`
    fn kind(&self) -> &'static str;

    async fn extract(&self, entity: &EntitySpec) -> Result<Vec<Record>>;
}

/// Loaders keyed by kind, populated by explicit registration
#[derive(Clone)]
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn SourceLoader>>,
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl LoaderRegistry {
    pub fn empty() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Registry with the `csv` and `fixed` loaders
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(CsvLoader));
        registry.register(Arc::new(FixedLoader));
        registry
    }

    pub fn register(&mut self, loader: Arc<dyn SourceLoader>) {
        self.loaders.insert(loader.kind().to_string(), loader);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn SourceLoader>> {
        self.loaders.get(kind).cloned()
    }

    /// Loader for an entity: its declared kind, or `fixed` for inline values.
    pub fn for_entity(&self, entity: &EntitySpec) -> Option<Arc<dyn SourceLoader>> {
        match &entity.loader {
            Some(loader) => self.get(&loader.kind),
            None if !entity.values.is_empty() => self.get("fixed"),
            None => None,
        }
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.loaders.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Delimited text files; empty cells become null, other cells stay text
pub struct CsvLoader;

#[async_trait]
impl SourceLoader for CsvLoader {
    fn kind(&self) -> &'static str {
        "csv"
    }

    async fn extract(&self, entity: &EntitySpec) -> Result<Vec<Record>> {
        let loader = entity
            .loader
            .as_ref()
            .ok_or_else(|| HarmonizeError::source(&entity.name, "csv loader requires a loader table"))?;
        let path: PathBuf = loader
            .path
            .clone()
            .ok_or_else(|| HarmonizeError::source(&entity.name, "csv loader requires a path"))?;
        let delimiter = match loader.delimiter.as_deref() {
            None => b',',
            Some("\\t") | Some("tab") => b'\t',
            Some(d) if d.len() == 1 => d.as_bytes()[0],
            Some(d) => {
                return Err(HarmonizeError::source(
                    &entity.name,
                    format!("invalid delimiter '{}'", d),
                ))
            }
        };

        let name = entity.name.clone();
        let records = tokio::task::spawn_blocking(move || read_csv(&path, delimiter))
            .await
            .map_err(|e| HarmonizeError::source(&name, format!("reader task failed: {}", e)))?
            .map_err(|e| HarmonizeError::source(&name, e.to_string()))?;

        debug!("Read {} rows for '{}' from csv", records.len(), entity.name);
        Ok(records)
    }
}

fn read_csv(path: &Path, delimiter: u8) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(h, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (h.clone(), value)
            })
            .collect();
        records.push(record);
    }
    Ok(records)
}

/// Inline `values` rows, positional against `columns`
pub struct FixedLoader;

#[async_trait]
impl SourceLoader for FixedLoader {
    fn kind(&self) -> &'static str {
        "fixed"
    }

    async fn extract(&self, entity: &EntitySpec) -> Result<Vec<Record>> {
        positional_records(&entity.name, &entity.columns, &entity.values)
    }
}

/// Zip positional rows with column names.
pub fn positional_records(entity: &str, columns: &[String], values: &[Vec<Value>]) -> Result<Vec<Record>> {
    values
        .iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != columns.len() {
                return Err(HarmonizeError::source(
                    entity,
                    format!(
                        "fixed row {} has {} values but {} columns are declared",
                        i + 1,
                        row.len(),
                        columns.len()
                    ),
                ));
            }
            Ok(columns.iter().cloned().zip(row.iter().cloned()).collect())
        })
        .collect()
}

/// Records held in memory, keyed by entity name; used for embedding and tests
#[derive(Default)]
pub struct MemoryLoader {
    tables: RwLock<HashMap<String, Vec<Record>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: &str, records: Vec<Record>) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(entity.to_string(), records);
        }
    }
}

#[async_trait]
impl SourceLoader for MemoryLoader {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn extract(&self, entity: &EntitySpec) -> Result<Vec<Record>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| HarmonizeError::source(&entity.name, "memory loader lock poisoned"))?;
        tables
            .get(&entity.name)
            .cloned()
            .ok_or_else(|| HarmonizeError::source(&entity.name, "no in-memory rows registered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::LoaderSpec;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn test_csv_loader_reads_rows_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "site_name;altitude").unwrap();
        writeln!(file, "Uppsala;12").unwrap();
        writeln!(file, "Lund;").unwrap();

        let mut entity = EntitySpec::new("site", "site_id");
        entity.loader = Some(LoaderSpec {
            kind: "csv".to_string(),
            path: Some(file.path().to_path_buf()),
            delimiter: Some(";".to_string()),
            options: Default::default(),
        });

        let records = CsvLoader.extract(&entity).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["site_name"], json!("Uppsala"));
        assert_eq!(records[0]["altitude"], json!("12"));
        assert_eq!(records[1]["altitude"], Value::Null);
    }

    #[tokio::test]
    async fn test_fixed_loader_rejects_ragged_rows() {
        let mut entity = EntitySpec::new("method", "method_id");
        entity.columns = vec!["name".to_string(), "unit".to_string()];
        entity.values = vec![vec![json!("pH"), json!("-")], vec![json!("LOI")]];

        let err = FixedLoader.extract(&entity).await.unwrap_err();
        assert!(matches!(err, HarmonizeError::Source { .. }));
    }

    #[test]
    fn test_registry_resolves_inline_values_to_fixed() {
        let registry = LoaderRegistry::with_builtins();
        let mut entity = EntitySpec::new("method", "method_id");
        assert!(registry.for_entity(&entity).is_none());

        entity.values = vec![vec![json!("pH")]];
        assert_eq!(registry.for_entity(&entity).map(|l| l.kind()), Some("fixed"));
        assert_eq!(registry.kinds(), vec!["csv".to_string(), "fixed".to_string()]);
    }
}
