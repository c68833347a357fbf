use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::{apply_decision, HumanDecision, MappingEntry, MappingKey, MappingRegistry, MappingStatus};
use crate::error::{HarmonizeError, Result};
use crate::observability::registry as metrics;

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS mappings (
        entity        TEXT NOT NULL,
        target_field  TEXT NOT NULL,
        value         TEXT NOT NULL,
        external_id   TEXT,
        status        TEXT NOT NULL,
        candidate     TEXT,
        is_override   INTEGER NOT NULL DEFAULT 0,
        decision      TEXT,
        updated_at    TEXT NOT NULL,
        PRIMARY KEY (entity, target_field, value)
    );
"#;

const SELECT_COLUMNS: &str =
    "entity, target_field, value, external_id, status, candidate, is_override, decision, updated_at";

/// SQLite-backed registry; one connection guarded by a mutex serializes writes
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!("🗂️ Opened mapping registry at {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HarmonizeError::Registry("registry connection lock poisoned".to_string()))
    }
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        key: MappingKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        external_id: row.get(3)?,
        status: row.get(4)?,
        candidate: row.get(5)?,
        is_override: row.get::<_, i64>(6)? != 0,
        decision: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Row as stored; JSON and enum columns are decoded after the query
struct RawEntry {
    key: MappingKey,
    external_id: Option<String>,
    status: String,
    candidate: Option<String>,
    is_override: bool,
    decision: Option<String>,
    updated_at: String,
}

impl RawEntry {
    fn decode(self) -> Result<MappingEntry> {
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| HarmonizeError::Registry(format!("bad timestamp for {}: {}", self.key, e)))?;
        Ok(MappingEntry {
            status: self.status.parse::<MappingStatus>()?,
            candidate: self.candidate.as_deref().map(serde_json::from_str).transpose()?,
            decision: self.decision.as_deref().map(serde_json::from_str).transpose()?,
            key: self.key,
            external_id: self.external_id,
            is_override: self.is_override,
            updated_at,
        })
    }
}

fn write_entry(conn: &Connection, entry: &MappingEntry, respect_override: bool) -> Result<usize> {
    let candidate = entry.candidate.as_ref().map(serde_json::to_string).transpose()?;
    let decision = entry.decision.as_ref().map(serde_json::to_string).transpose()?;
    let guard = if respect_override { "WHERE mappings.is_override = 0" } else { "" };
    let sql = format!(
        "INSERT INTO mappings ({SELECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(entity, target_field, value) DO UPDATE SET
             external_id = excluded.external_id,
             status = excluded.status,
             candidate = excluded.candidate,
             is_override = excluded.is_override,
             decision = excluded.decision,
             updated_at = excluded.updated_at
         {guard}"
    );
    let changed = conn.execute(
        &sql,
        params![
            entry.key.entity,
            entry.key.target_field,
            entry.key.value,
            entry.external_id,
            entry.status.as_str(),
            candidate,
            entry.is_override as i64,
            decision,
            entry.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(changed)
}

fn query_one(conn: &Connection, key: &MappingKey) -> Result<Option<MappingEntry>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM mappings WHERE entity = ?1 AND target_field = ?2 AND value = ?3");
    let raw = conn
        .query_row(&sql, params![key.entity, key.target_field, key.value], read_entry)
        .optional()?;
    raw.map(RawEntry::decode).transpose()
}

#[async_trait]
impl MappingRegistry for SqliteRegistry {
    async fn get(&self, key: &MappingKey) -> Result<Option<MappingEntry>> {
        let conn = self.lock()?;
        query_one(&conn, key)
    }

    async fn upsert_automatic(&self, entries: Vec<MappingEntry>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        for entry in &entries {
            written += write_entry(&tx, entry, true)?;
        }
        tx.commit()?;
        debug!("Upserted {}/{} automatic mappings", written, entries.len());
        metrics::writes(written);
        Ok(written)
    }

    async fn record_override(&self, key: &MappingKey, decision: HumanDecision) -> Result<MappingEntry> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = query_one(&tx, key)?;
        let entry = apply_decision(key, current.as_ref(), decision)?;
        write_entry(&tx, &entry, false)?;
        tx.commit()?;
        metrics::override_recorded();
        info!("✍️ Recorded {} override for {}", entry.decision.as_ref().map(|d| d.decision.action()).unwrap_or("unknown"), key);
        Ok(entry)
    }

    async fn list(&self, entity: &str) -> Result<Vec<MappingEntry>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM mappings WHERE entity = ?1 ORDER BY target_field, value");
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params![entity], read_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawEntry::decode).collect()
    }
}
