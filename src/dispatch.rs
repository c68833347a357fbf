//! Dispatch collaborators: hand a frozen entity table to its target.
//!
//! `store` is atomic per entity. The CSV target writes to a temporary file in
//! the target directory and renames it into place, so a failed store leaves
//! any previous file untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{HarmonizeError, Result};
use crate::spec::TargetSpec;
use crate::table::{canonical, EntityTable, FrozenTable};

/// Acknowledgement of a completed store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreAck {
    pub entity: String,
    pub rows: usize,
    pub location: Option<String>,
    /// SHA-256 of the dispatched CSV rendering
    pub digest: String,
    pub stored_at: DateTime<Utc>,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn store(&self, entity: &str, table: FrozenTable, target: &TargetSpec) -> Result<StoreAck>;
}

/// Dispatcher for a target kind
pub fn dispatcher_for(target: &TargetSpec) -> Result<Arc<dyn Dispatcher>> {
    match target.kind.as_str() {
        "csv" => Ok(Arc::new(CsvDispatcher)),
        "memory" => Ok(Arc::new(MemoryDispatcher::new())),
        other => Err(HarmonizeError::configuration(
            format!("unknown target kind '{}'", other),
            Vec::new(),
        )),
    }
}

/// Render a table as CSV with a header row; nulls are empty cells.
pub fn encode_csv(table: &EntityTable) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.columns())?;
    for row in table.rows() {
        writer.write_record(row.iter().map(|v| canonical(v).unwrap_or_default()))?;
    }
    writer
        .into_inner()
        .map_err(|e| HarmonizeError::Io(e.into_error()))
}

pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// One `<entity>.csv` per entity under the target path
pub struct CsvDispatcher;

fn write_atomically(dir: &Path, entity: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(format!("{}.csv", entity));
    let tmp_path = dir.join(format!(".{}.csv.tmp", entity));
    std::fs::write(&tmp_path, bytes)?;
    if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(final_path)
}

#[async_trait]
impl Dispatcher for CsvDispatcher {
    fn kind(&self) -> &'static str {
        "csv"
    }

    async fn store(&self, entity: &str, table: FrozenTable, target: &TargetSpec) -> Result<StoreAck> {
        let dir = target
            .path
            .clone()
            .ok_or_else(|| HarmonizeError::store(entity, "csv target requires a path"))?;
        let bytes = encode_csv(&table)?;
        let digest = digest(&bytes);

        let name = entity.to_string();
        let path = tokio::task::spawn_blocking(move || write_atomically(&dir, &name, &bytes))
            .await
            .map_err(|e| HarmonizeError::store(entity, format!("writer task failed: {}", e)))?
            .map_err(|e| HarmonizeError::store(entity, e.to_string()))?;

        info!("💾 Stored {} rows of '{}' to {}", table.len(), entity, path.display());
        Ok(StoreAck {
            entity: entity.to_string(),
            rows: table.len(),
            location: Some(path.display().to_string()),
            digest,
            stored_at: Utc::now(),
        })
    }
}

/// Keeps stored tables in memory; entities listed in `fail_on` are refused
#[derive(Default)]
pub struct MemoryDispatcher {
    tables: Mutex<HashMap<String, FrozenTable>>,
    fail_on: HashSet<String>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(entities: &[&str]) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            fail_on: entities.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn stored(&self, entity: &str) -> Option<FrozenTable> {
        self.tables.lock().ok()?.get(entity).cloned()
    }

    pub fn stored_entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[async_trait]
impl Dispatcher for MemoryDispatcher {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, entity: &str, table: FrozenTable, _target: &TargetSpec) -> Result<StoreAck> {
        if self.fail_on.contains(entity) {
            return Err(HarmonizeError::store(entity, "target refused the table"));
        }
        let digest = digest(&encode_csv(&table)?);
        let rows = table.len();
        self.tables
            .lock()
            .map_err(|_| HarmonizeError::store(entity, "memory target lock poisoned"))?
            .insert(entity.to_string(), table);
        debug!("Stored {} rows of '{}' in memory", rows, entity);
        Ok(StoreAck {
            entity: entity.to_string(),
            rows,
            location: None,
            digest,
            stored_at: Utc::now(),
        })
    }
}
