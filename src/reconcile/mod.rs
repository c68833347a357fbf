//! Reconciliation matcher.
//!
//! Distinct values of the target field are checked against the mapping
//! registry first; only values without a settled entry are sent to the
//! service. Batches run concurrently up to a semaphore bound and every call
//! has a timeout. A failed or timed-out batch leaves the registry untouched and
//! its values come back as retryable unmatched.

pub mod classify;
pub mod service;

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{HarmonizeError, Result};
use crate::issues::{IssueCode, ValidationIssue};
use crate::mapping::{MappingEntry, MappingKey, MappingRegistry, MappingStatus};
use crate::observability::reconcile as metrics;
use crate::spec::ReconciliationSpec;
use crate::table::{canonical, EntityTable};

pub use classify::classify;
pub use service::{HttpReconciliationService, ReconciliationQuery, ReconciliationService, ServiceCandidate};

/// Values named in summary issues
const SAMPLE_LIMIT: usize = 10;

/// Per-value result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueOutcome {
    pub value: String,
    pub status: MappingStatus,
    pub external_id: Option<String>,
    /// The value was not classified because the service failed; retry later
    pub retryable: bool,
    /// Decided by an earlier run or a human; no query was sent
    pub from_registry: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub entity: String,
    pub target_field: String,
    pub values: Vec<ValueOutcome>,
    /// Queries actually sent to the service
    pub queried: usize,
    #[serde(skip)]
    pub issues: Vec<ValidationIssue>,
}

impl ReconcileOutcome {
    pub fn count(&self, status: MappingStatus) -> usize {
        self.values.iter().filter(|v| v.status == status).count()
    }

    pub fn retryable(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|v| v.retryable)
            .map(|v| v.value.as_str())
            .collect()
    }
}

/// Settings shared by every reconciliation in a run
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_concurrency: 4,
        }
    }
}

pub struct Reconciler {
    service: Arc<dyn ReconciliationService>,
    registry: Arc<dyn MappingRegistry>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

struct PendingValue {
    value: String,
    properties: Vec<(String, String)>,
}

impl Reconciler {
    pub fn new(
        service: Arc<dyn ReconciliationService>,
        registry: Arc<dyn MappingRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            service,
            registry,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            timeout: config.timeout,
        }
    }

    pub async fn reconcile(&self, spec: &ReconciliationSpec, table: &EntityTable) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome {
            entity: spec.entity.clone(),
            target_field: spec.target_field.clone(),
            ..Default::default()
        };

        let mut pending = Vec::new();
        for candidate in distinct_values(spec, table)? {
            let key = MappingKey::new(&spec.entity, &spec.target_field, &candidate.value);
            match self.registry.get(&key).await? {
                Some(entry) if entry.is_settled() => outcome.values.push(ValueOutcome {
                    value: candidate.value,
                    status: entry.status,
                    external_id: entry.published_id().map(str::to_string),
                    retryable: false,
                    from_registry: true,
                }),
                _ => pending.push(candidate),
            }
        }
        debug!(
            "Reconciling '{}.{}': {} settled, {} to query",
            spec.entity,
            spec.target_field,
            outcome.values.len(),
            pending.len()
        );

        let mut tasks = JoinSet::new();
        for (batch_no, batch) in pending.chunks(spec.batch_size.max(1)).enumerate() {
            let queries: Vec<ReconciliationQuery> = batch
                .iter()
                .map(|p| ReconciliationQuery {
                    value: p.value.clone(),
                    service_type: spec.service_type.clone(),
                    properties: p.properties.clone(),
                    limit: spec.max_candidates,
                })
                .collect();
            let service = Arc::clone(&self.service);
            let permits = Arc::clone(&self.permits);
            let timeout = self.timeout;
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let started = Instant::now();
                let result = tokio::time::timeout(timeout, service.query_batch(&queries)).await;
                metrics::batch_sent(queries.len(), started.elapsed().as_secs_f64());
                let result = match result {
                    Ok(Ok(candidates)) if candidates.len() == queries.len() => Ok(candidates),
                    Ok(Ok(candidates)) => Err(format!(
                        "service answered {} of {} queries",
                        candidates.len(),
                        queries.len()
                    )),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", timeout)),
                };
                (batch_no, queries, result)
            });
        }

        let mut batches = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let batch = joined.map_err(|e| HarmonizeError::ReconciliationService(format!("query task failed: {}", e)))?;
            batches.push(batch);
        }
        batches.sort_by_key(|(batch_no, _, _)| *batch_no);

        let mut entries = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        for (_, queries, result) in batches {
            outcome.queried += queries.len();
            match result {
                Ok(candidates) => {
                    for (query, found) in queries.into_iter().zip(candidates) {
                        let (status, best) = classify(&found, spec);
                        let key = MappingKey::new(&spec.entity, &spec.target_field, &query.value);
                        let entry = MappingEntry::automatic(key, status, best);
                        outcome.values.push(ValueOutcome {
                            value: query.value,
                            status,
                            external_id: entry.published_id().map(str::to_string),
                            retryable: false,
                            from_registry: false,
                        });
                        entries.push(entry);
                    }
                }
                Err(reason) => {
                    metrics::service_error();
                    warn!("⚠️ Reconciliation batch for '{}' failed: {}", spec.entity, reason);
                    if failed.is_empty() {
                        outcome.issues.push(
                            ValidationIssue::warning(
                                &spec.entity,
                                IssueCode::ReconciliationDegraded,
                                format!("Reconciliation service unavailable: {}", reason),
                            )
                            .with_field(spec.target_field.clone())
                            .with_suggestion("Values were left unmatched and will be queried again on the next run"),
                        );
                    }
                    for query in queries {
                        failed.push(query.value.clone());
                        outcome.values.push(ValueOutcome {
                            value: query.value,
                            status: MappingStatus::Unmatched,
                            external_id: None,
                            retryable: true,
                            from_registry: false,
                        });
                    }
                }
            }
        }

        if !entries.is_empty() {
            self.registry.upsert_automatic(entries).await?;
        }

        let review: Vec<&str> = outcome
            .values
            .iter()
            .filter(|v| v.status == MappingStatus::NeedsReview)
            .map(|v| v.value.as_str())
            .collect();
        if !review.is_empty() {
            let sample: Vec<&str> = review.iter().copied().take(SAMPLE_LIMIT).collect();
            let issue = ValidationIssue::info(
                &spec.entity,
                IssueCode::PendingReview,
                format!("{} values need review: {}", review.len(), sample.join(", ")),
            )
            .with_field(spec.target_field.clone())
            .with_suggestion("Accept or reject them with `harmonize mappings`");
            outcome.issues.push(issue);
        }

        let (matched, needs_review, unmatched) = (
            outcome.count(MappingStatus::Matched),
            outcome.count(MappingStatus::NeedsReview),
            outcome.count(MappingStatus::Unmatched),
        );
        metrics::classified(matched, needs_review, unmatched);
        info!(
            "🔗 Reconciled '{}.{}': {} matched, {} need review, {} unmatched ({} queried, {} retryable)",
            spec.entity,
            spec.target_field,
            matched,
            needs_review,
            unmatched,
            outcome.queried,
            failed.len()
        );
        Ok(outcome)
    }
}

/// Distinct non-null target values in row order, with context from their first row.
fn distinct_values(spec: &ReconciliationSpec, table: &EntityTable) -> Result<Vec<PendingValue>> {
    let target = table.column_index(&spec.target_field).ok_or_else(|| {
        HarmonizeError::stage(
            &spec.entity,
            "reconcile",
            format!("target field '{}' is not a column", spec.target_field),
        )
    })?;
    let mut properties = Vec::with_capacity(spec.property_mappings.len());
    for (pid, column) in &spec.property_mappings {
        let idx = table.column_index(column).ok_or_else(|| {
            HarmonizeError::stage(
                &spec.entity,
                "reconcile",
                format!("property '{}' maps to missing column '{}'", pid, column),
            )
        })?;
        properties.push((pid.clone(), idx));
    }

    let mut seen = HashSet::new();
    let mut values = Vec::new();
    for row in table.rows() {
        let Some(value) = canonical(&row[target]) else {
            continue;
        };
        if !seen.insert(value.clone()) {
            continue;
        }
        let context = properties
            .iter()
            .filter_map(|(pid, idx)| canonical(&row[*idx]).map(|v| (pid.clone(), v)))
            .collect();
        values.push(PendingValue {
            value,
            properties: context,
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{HumanDecision, InMemoryRegistry, OverrideDecision};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scores by value; counts every query it receives
    struct ScriptedService {
        scores: HashMap<String, f64>,
        queries: AtomicUsize,
        fail: bool,
    }

    impl ScriptedService {
        fn new(scores: &[(&str, f64)]) -> Self {
            Self {
                scores: scores.iter().map(|(v, s)| (v.to_string(), *s)).collect(),
                queries: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ReconciliationService for ScriptedService {
        async fn query_batch(&self, queries: &[ReconciliationQuery]) -> Result<Vec<Vec<ServiceCandidate>>> {
            self.queries.fetch_add(queries.len(), Ordering::SeqCst);
            if self.fail {
                return Err(HarmonizeError::ReconciliationService("connection refused".to_string()));
            }
            Ok(queries
                .iter()
                .map(|q| {
                    self.scores
                        .get(&q.value)
                        .map(|s| {
                            vec![ServiceCandidate {
                                external_id: format!("ext-{}", q.value),
                                label: q.value.clone(),
                                score: *s,
                                exact: false,
                            }]
                        })
                        .unwrap_or_default()
                })
                .collect())
        }
    }

    fn sites(names: &[&str]) -> EntityTable {
        let mut t = EntityTable::new("site", vec!["site_name".to_string()]);
        for n in names {
            t.push_row(vec![json!(n)]);
        }
        t
    }

    fn spec() -> ReconciliationSpec {
        let mut spec = ReconciliationSpec::new("site", "site_name", "site");
        spec.batch_size = 2;
        spec
    }

    #[tokio::test]
    async fn test_classifies_and_persists() {
        let service = Arc::new(ScriptedService::new(&[("Uppsala", 97.0), ("Lund", 85.0), ("Umeå", 40.0)]));
        let registry = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(service.clone(), registry.clone(), ReconcilerConfig::default());

        let outcome = reconciler
            .reconcile(&spec(), &sites(&["Uppsala", "Lund", "Uppsala", "Umeå"]))
            .await
            .unwrap();

        assert_eq!(outcome.queried, 3);
        assert_eq!(outcome.count(MappingStatus::Matched), 1);
        assert_eq!(outcome.count(MappingStatus::NeedsReview), 1);
        assert_eq!(outcome.count(MappingStatus::Unmatched), 1);
        assert_eq!(registry.len(), 3);
        assert_eq!(outcome.issues[0].code, IssueCode::PendingReview);
    }

    #[tokio::test]
    async fn test_rerun_only_requeries_unsettled_values() {
        let service = Arc::new(ScriptedService::new(&[("Uppsala", 97.0), ("Lund", 85.0)]));
        let registry = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(service.clone(), registry.clone(), ReconcilerConfig::default());
        let table = sites(&["Uppsala", "Lund"]);

        reconciler.reconcile(&spec(), &table).await.unwrap();
        let second = reconciler.reconcile(&spec(), &table).await.unwrap();

        assert_eq!(second.queried, 1);
        assert_eq!(service.queries.load(Ordering::SeqCst), 3);

        registry
            .record_override(
                &MappingKey::new("site", "site_name", "Lund"),
                HumanDecision::new(OverrideDecision::Reject),
            )
            .await
            .unwrap();
        let third = reconciler.reconcile(&spec(), &table).await.unwrap();
        assert_eq!(third.queried, 0);
    }

    #[tokio::test]
    async fn test_service_failure_is_retryable_and_not_persisted() {
        let mut scripted = ScriptedService::new(&[("Uppsala", 97.0)]);
        scripted.fail = true;
        let registry = Arc::new(InMemoryRegistry::new());
        let reconciler = Reconciler::new(Arc::new(scripted), registry.clone(), ReconcilerConfig::default());

        let outcome = reconciler.reconcile(&spec(), &sites(&["Uppsala", "Lund", "Umeå"])).await.unwrap();

        assert_eq!(outcome.retryable().len(), 3);
        assert!(registry.is_empty());
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].code, IssueCode::ReconciliationDegraded);
    }

    struct StalledService;

    #[async_trait]
    impl ReconciliationService for StalledService {
        async fn query_batch(&self, _queries: &[ReconciliationQuery]) -> Result<Vec<Vec<ServiceCandidate>>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_timeout_yields_retryable_unmatched() {
        let registry = Arc::new(InMemoryRegistry::new());
        let config = ReconcilerConfig {
            timeout: Duration::from_millis(20),
            max_concurrency: 1,
        };
        let reconciler = Reconciler::new(Arc::new(StalledService), registry.clone(), config);

        let outcome = reconciler.reconcile(&spec(), &sites(&["Uppsala"])).await.unwrap();

        assert_eq!(outcome.values[0].status, MappingStatus::Unmatched);
        assert!(outcome.values[0].retryable);
        assert!(outcome.issues[0].message.contains("timed out"));
        assert!(registry.is_empty());
    }

    /// Tracks how many batches are in flight at once
    #[derive(Default)]
    struct SlowService {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl ReconciliationService for SlowService {
        async fn query_batch(&self, queries: &[ReconciliationQuery]) -> Result<Vec<Vec<ServiceCandidate>>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Vec::new(); queries.len()])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batches_respect_max_concurrency() {
        let service = Arc::new(SlowService::default());
        let config = ReconcilerConfig {
            timeout: Duration::from_secs(5),
            max_concurrency: 2,
        };
        let reconciler = Reconciler::new(service.clone(), Arc::new(InMemoryRegistry::new()), config);
        let mut spec = spec();
        spec.batch_size = 1;

        let outcome = reconciler
            .reconcile(&spec, &sites(&["Uppsala", "Lund", "Umeå", "Kiruna", "Visby", "Malmö"]))
            .await
            .unwrap();

        assert_eq!(outcome.queried, 6);
        assert_eq!(service.batches.load(Ordering::SeqCst), 6);
        let peak = service.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak in-flight batches was {}", peak);
    }

    #[tokio::test]
    async fn test_missing_target_field_is_stage_error() {
        let reconciler = Reconciler::new(
            Arc::new(ScriptedService::new(&[])),
            Arc::new(InMemoryRegistry::new()),
            ReconcilerConfig::default(),
        );
        let mut spec = spec();
        spec.target_field = "name".to_string();
        let err = reconciler.reconcile(&spec, &sites(&["Uppsala"])).await.unwrap_err();
        assert!(matches!(err, HarmonizeError::Stage { stage: "reconcile", .. }));
    }
}
