use std::collections::HashMap;

use super::extract::fill_surrogate;
use crate::error::Result;
use crate::mapping::{MappingRegistry, MappingStatus};
use crate::spec::EntitySpec;
use crate::table::{canonical, EntityTable, Value};

/// Matched external ids for an entity's reconciled field, keyed by local value.
///
/// Entries are read under the reconciliation's own entity key, the one the
/// reconciler writes them with.
pub async fn published_ids(spec: &EntitySpec, registry: &dyn MappingRegistry) -> Result<HashMap<String, String>> {
    let Some(recon) = &spec.reconciliation else {
        return Ok(HashMap::new());
    };
    Ok(registry
        .list(&recon.entity)
        .await?
        .into_iter()
        .filter(|e| e.key.target_field == recon.target_field && e.status == MappingStatus::Matched)
        .filter_map(|e| e.external_id.map(|id| (e.key.value, id)))
        .collect())
}

/// Fill the surrogate column with system ids and the public id column with
/// external ids where a matched mapping exists, system ids otherwise.
///
/// Returns the number of rows that received an external id.
pub fn assign_ids(spec: &EntitySpec, table: &mut EntityTable, published: &HashMap<String, String>) -> usize {
    fill_surrogate(spec, table);

    let target = spec
        .reconciliation
        .as_ref()
        .and_then(|r| table.column_index(&r.target_field));
    let public = table.ensure_column(spec.public_id());
    let mut external = 0;
    for row in 0..table.len() {
        let matched = target
            .and_then(|t| canonical(&table.row(row)[t]))
            .and_then(|v| published.get(&v));
        let value = match matched {
            Some(id) => {
                external += 1;
                Value::String(id.clone())
            }
            None => Value::from(table.system_id(row)),
        };
        table.set(row, public, value);
    }
    external
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Candidate, InMemoryRegistry, MappingEntry, MappingKey};
    use crate::spec::ReconciliationSpec;
    use serde_json::json;

    #[tokio::test]
    async fn test_matched_values_get_external_ids() {
        let mut spec = EntitySpec::new("site", "site_id");
        spec.public_id = Some("site_uri".to_string());
        spec.reconciliation = Some(ReconciliationSpec::new("site", "site_name", "site"));

        let registry = InMemoryRegistry::new();
        registry
            .upsert_automatic(vec![
                MappingEntry::automatic(
                    MappingKey::new("site", "site_name", "Uppsala"),
                    MappingStatus::Matched,
                    Some(Candidate {
                        external_id: "Q25286".to_string(),
                        label: "Uppsala".to_string(),
                        score: 97.0,
                    }),
                ),
                MappingEntry::automatic(
                    MappingKey::new("site", "site_name", "Lund"),
                    MappingStatus::NeedsReview,
                    Some(Candidate {
                        external_id: "Q2167".to_string(),
                        label: "Lund".to_string(),
                        score: 85.0,
                    }),
                ),
            ])
            .await
            .unwrap();

        let mut table = EntityTable::new("site", vec!["site_name".to_string()]);
        table.push_row(vec![json!("Uppsala")]);
        table.push_row(vec![json!("Lund")]);

        let published = published_ids(&spec, &registry).await.unwrap();
        let external = assign_ids(&spec, &mut table, &published);

        assert_eq!(external, 1);
        assert_eq!(table.value(0, "site_uri"), Some(&json!("Q25286")));
        assert_eq!(table.value(1, "site_uri"), Some(&json!(2)));
        assert_eq!(table.value(1, "site_id"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_published_ids_use_the_reconciliation_key() {
        let mut spec = EntitySpec::new("site", "site_id");
        spec.reconciliation = Some(ReconciliationSpec::new("locality", "site_name", "site"));

        let registry = InMemoryRegistry::new();
        registry
            .upsert_automatic(vec![MappingEntry::automatic(
                MappingKey::new("locality", "site_name", "Uppsala"),
                MappingStatus::Matched,
                Some(Candidate {
                    external_id: "Q25286".to_string(),
                    label: "Uppsala".to_string(),
                    score: 97.0,
                }),
            )])
            .await
            .unwrap();

        let published = published_ids(&spec, &registry).await.unwrap();
        assert_eq!(published.get("Uppsala").map(String::as_str), Some("Q25286"));
    }
}
