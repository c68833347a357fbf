//! Reconciliation service contract and its HTTP implementation.
//!
//! The wire format follows the reconciliation API used by OpenRefine: a batch
//! of queries keyed `q0..qN` is posted as the `queries` form field and the
//! response maps each key to a ranked `result` list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{HarmonizeError, Result};

/// One value to resolve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationQuery {
    pub value: String,
    pub service_type: String,
    /// Context properties as (service property id, value)
    pub properties: Vec<(String, String)>,
    pub limit: usize,
}

/// Ranked candidate returned by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCandidate {
    #[serde(rename = "id")]
    pub external_id: String,
    #[serde(rename = "name", default)]
    pub label: String,
    pub score: f64,
    #[serde(rename = "match", default)]
    pub exact: bool,
}

#[async_trait]
pub trait ReconciliationService: Send + Sync {
    /// Candidates for each query, in query order
    async fn query_batch(&self, queries: &[ReconciliationQuery]) -> Result<Vec<Vec<ServiceCandidate>>>;
}

pub struct HttpReconciliationService {
    client: reqwest::Client,
    url: String,
}

impl HttpReconciliationService {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("harmonize/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    result: Vec<ServiceCandidate>,
}

/// `{"q0": {"query": ..., "type": ..., "limit": ..., "properties": [...]}, ...}`
pub fn encode_queries(queries: &[ReconciliationQuery]) -> serde_json::Value {
    let body: serde_json::Map<String, serde_json::Value> = queries
        .iter()
        .enumerate()
        .map(|(i, q)| {
            let properties: Vec<serde_json::Value> = q
                .properties
                .iter()
                .map(|(pid, v)| json!({ "pid": pid, "v": v }))
                .collect();
            (
                format!("q{}", i),
                json!({
                    "query": q.value,
                    "type": q.service_type,
                    "limit": q.limit,
                    "properties": properties,
                }),
            )
        })
        .collect();
    serde_json::Value::Object(body)
}

/// Decode a batch response; missing keys yield no candidates.
pub fn decode_results(body: &str, count: usize) -> Result<Vec<Vec<ServiceCandidate>>> {
    let mut parsed: HashMap<String, QueryResult> = serde_json::from_str(body)?;
    Ok((0..count)
        .map(|i| {
            let mut candidates = parsed
                .remove(&format!("q{}", i))
                .map(|r| r.result)
                .unwrap_or_default();
            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
            candidates
        })
        .collect())
}

#[async_trait]
impl ReconciliationService for HttpReconciliationService {
    async fn query_batch(&self, queries: &[ReconciliationQuery]) -> Result<Vec<Vec<ServiceCandidate>>> {
        let payload = encode_queries(queries).to_string();
        debug!("Posting {} reconciliation queries to {}", queries.len(), self.url);

        let resp = self
            .client
            .post(&self.url)
            .form(&[("queries", payload.as_str())])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(HarmonizeError::ReconciliationService(format!(
                "{} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }
        decode_results(&body, queries.len())
    }
}
