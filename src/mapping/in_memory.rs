use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::{apply_decision, HumanDecision, MappingEntry, MappingKey, MappingRegistry};
use crate::error::{HarmonizeError, Result};
use crate::observability::registry as metrics;

/// In-memory registry for tests and single-run use
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    entries: Arc<RwLock<BTreeMap<MappingKey, MappingEntry>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> HarmonizeError {
    HarmonizeError::Registry("registry lock poisoned".to_string())
}

#[async_trait]
impl MappingRegistry for InMemoryRegistry {
    async fn get(&self, key: &MappingKey) -> Result<Option<MappingEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn upsert_automatic(&self, batch: Vec<MappingEntry>) -> Result<usize> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let mut written = 0;
        for entry in batch {
            if entries.get(&entry.key).is_some_and(|e| e.is_override) {
                debug!("Keeping override for {}", entry.key);
                continue;
            }
            entries.insert(entry.key.clone(), entry);
            written += 1;
        }
        metrics::writes(written);
        Ok(written)
    }

    async fn record_override(&self, key: &MappingKey, decision: HumanDecision) -> Result<MappingEntry> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let entry = apply_decision(key, entries.get(key), decision)?;
        entries.insert(key.clone(), entry.clone());
        metrics::override_recorded();
        Ok(entry)
    }

    async fn list(&self, entity: &str) -> Result<Vec<MappingEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .values()
            .filter(|e| e.key.entity == entity)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Candidate, MappingStatus, OverrideDecision};

    #[tokio::test]
    async fn test_override_survives_automatic_upsert() {
        let registry = InMemoryRegistry::new();
        let key = MappingKey::new("site", "site_name", "Lund");
        registry
            .record_override(&key, HumanDecision::new(OverrideDecision::MarkUnmatched))
            .await
            .unwrap();

        let automatic = MappingEntry::automatic(
            key.clone(),
            MappingStatus::Matched,
            Some(Candidate {
                external_id: "Q2167".to_string(),
                label: "Lund".to_string(),
                score: 99.0,
            }),
        );
        let written = registry.upsert_automatic(vec![automatic]).await.unwrap();

        assert_eq!(written, 0);
        let stored = registry.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, MappingStatus::Unmatched);
        assert!(stored.is_override);
    }

    #[tokio::test]
    async fn test_list_filters_by_entity() {
        let registry = InMemoryRegistry::new();
        registry
            .upsert_automatic(vec![
                MappingEntry::automatic(MappingKey::new("site", "site_name", "b"), MappingStatus::Unmatched, None),
                MappingEntry::automatic(MappingKey::new("site", "site_name", "a"), MappingStatus::Unmatched, None),
                MappingEntry::automatic(MappingKey::new("taxon", "name", "x"), MappingStatus::Unmatched, None),
            ])
            .await
            .unwrap();

        let listed = registry.list("site").await.unwrap();
        let values: Vec<&str> = listed.iter().map(|e| e.key.value.as_str()).collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
