//! Metrics for harmonization runs
//!
//! Recording goes through the `metrics` facade and is a no-op until a recorder
//! is installed. The binary installs the Prometheus recorder with `--metrics`.

use std::fmt;
use std::sync::OnceLock;
use tracing::info;

/// All metric names used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Pipeline
    PipelineRuns,
    PipelineEntitiesCompleted,
    PipelineEntitiesFailed,
    PipelineEntitiesSkipped,
    PipelineRowsExtracted,
    PipelineRowsStored,
    PipelineEntityDuration,

    // Link
    LinkForeignKeysResolved,
    LinkRowsMatched,
    LinkRowsUnmatched,
    LinkViolations,

    // Reconcile
    ReconcileBatches,
    ReconcileQueries,
    ReconcileMatched,
    ReconcileNeedsReview,
    ReconcileUnmatched,
    ReconcileServiceErrors,
    ReconcileBatchDuration,

    // Registry
    RegistryWrites,
    RegistryOverrides,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::PipelineRuns => "harmonize_pipeline_runs_total",
            MetricName::PipelineEntitiesCompleted => "harmonize_pipeline_entities_completed_total",
            MetricName::PipelineEntitiesFailed => "harmonize_pipeline_entities_failed_total",
            MetricName::PipelineEntitiesSkipped => "harmonize_pipeline_entities_skipped_total",
            MetricName::PipelineRowsExtracted => "harmonize_pipeline_rows_extracted_total",
            MetricName::PipelineRowsStored => "harmonize_pipeline_rows_stored_total",
            MetricName::PipelineEntityDuration => "harmonize_pipeline_entity_duration_seconds",

            MetricName::LinkForeignKeysResolved => "harmonize_link_foreign_keys_resolved_total",
            MetricName::LinkRowsMatched => "harmonize_link_rows_matched_total",
            MetricName::LinkRowsUnmatched => "harmonize_link_rows_unmatched_total",
            MetricName::LinkViolations => "harmonize_link_violations_total",

            MetricName::ReconcileBatches => "harmonize_reconcile_batches_total",
            MetricName::ReconcileQueries => "harmonize_reconcile_queries_total",
            MetricName::ReconcileMatched => "harmonize_reconcile_matched_total",
            MetricName::ReconcileNeedsReview => "harmonize_reconcile_needs_review_total",
            MetricName::ReconcileUnmatched => "harmonize_reconcile_unmatched_total",
            MetricName::ReconcileServiceErrors => "harmonize_reconcile_service_errors_total",
            MetricName::ReconcileBatchDuration => "harmonize_reconcile_batch_duration_seconds",

            MetricName::RegistryWrites => "harmonize_registry_writes_total",
            MetricName::RegistryOverrides => "harmonize_registry_overrides_total",
        }
    }
}

static PROMETHEUS: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Calling it twice is an error from the facade.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;
    PROMETHEUS.set(handle).ok();
    info!("Metrics recorder installed");
    Ok(())
}

/// Prometheus text snapshot, if the recorder is installed
pub fn render() -> Option<String> {
    PROMETHEUS.get().map(|handle| handle.render())
}

// ============================================================================
// Pipeline Metrics
// ============================================================================

pub mod pipeline {
    use super::MetricName;

    pub fn run_started() {
        ::metrics::counter!(MetricName::PipelineRuns.as_str()).increment(1);
    }

    pub fn entity_completed(entity: &str, duration_secs: f64) {
        ::metrics::counter!(MetricName::PipelineEntitiesCompleted.as_str(), "entity" => entity.to_string())
            .increment(1);
        ::metrics::histogram!(MetricName::PipelineEntityDuration.as_str(), "entity" => entity.to_string())
            .record(duration_secs);
    }

    pub fn entity_failed(entity: &str) {
        ::metrics::counter!(MetricName::PipelineEntitiesFailed.as_str(), "entity" => entity.to_string())
            .increment(1);
    }

    pub fn entity_skipped() {
        ::metrics::counter!(MetricName::PipelineEntitiesSkipped.as_str()).increment(1);
    }

    pub fn rows_extracted(count: usize) {
        ::metrics::counter!(MetricName::PipelineRowsExtracted.as_str()).increment(count as u64);
    }

    pub fn rows_stored(count: usize) {
        ::metrics::counter!(MetricName::PipelineRowsStored.as_str()).increment(count as u64);
    }
}

// ============================================================================
// Link Metrics
// ============================================================================

pub mod link {
    use super::MetricName;

    /// Record the outcome of one foreign key resolution
    pub fn foreign_key_resolved(matched: usize, unmatched: usize) {
        ::metrics::counter!(MetricName::LinkForeignKeysResolved.as_str()).increment(1);
        ::metrics::counter!(MetricName::LinkRowsMatched.as_str()).increment(matched as u64);
        ::metrics::counter!(MetricName::LinkRowsUnmatched.as_str()).increment(unmatched as u64);
    }

    pub fn violations(count: usize) {
        ::metrics::counter!(MetricName::LinkViolations.as_str()).increment(count as u64);
    }
}

// ============================================================================
// Reconcile Metrics
// ============================================================================

pub mod reconcile {
    use super::MetricName;

    /// One service call carrying `queries` values
    pub fn batch_sent(queries: usize, duration_secs: f64) {
        ::metrics::counter!(MetricName::ReconcileBatches.as_str()).increment(1);
        ::metrics::counter!(MetricName::ReconcileQueries.as_str()).increment(queries as u64);
        ::metrics::histogram!(MetricName::ReconcileBatchDuration.as_str()).record(duration_secs);
    }

    pub fn classified(matched: usize, needs_review: usize, unmatched: usize) {
        ::metrics::counter!(MetricName::ReconcileMatched.as_str()).increment(matched as u64);
        ::metrics::counter!(MetricName::ReconcileNeedsReview.as_str()).increment(needs_review as u64);
        ::metrics::counter!(MetricName::ReconcileUnmatched.as_str()).increment(unmatched as u64);
    }

    pub fn service_error() {
        ::metrics::counter!(MetricName::ReconcileServiceErrors.as_str()).increment(1);
    }
}

// ============================================================================
// Registry Metrics
// ============================================================================

pub mod registry {
    use super::MetricName;

    pub fn writes(count: usize) {
        ::metrics::counter!(MetricName::RegistryWrites.as_str()).increment(count as u64);
    }

    pub fn override_recorded() {
        ::metrics::counter!(MetricName::RegistryOverrides.as_str()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            MetricName::PipelineRuns,
            MetricName::LinkViolations,
            MetricName::ReconcileBatchDuration,
            MetricName::RegistryOverrides,
        ] {
            assert!(name.as_str().starts_with("harmonize_"));
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    /// Sums counter increments by metric name
    #[derive(Default)]
    struct CountingRecorder {
        counters: std::sync::Mutex<std::collections::HashMap<String, std::sync::Arc<Tally>>>,
    }

    #[derive(Default)]
    struct Tally(std::sync::atomic::AtomicU64);

    impl ::metrics::CounterFn for Tally {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, std::sync::atomic::Ordering::SeqCst);
        }

        fn absolute(&self, value: u64) {
            self.0.store(value, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl CountingRecorder {
        fn total(&self, name: MetricName) -> u64 {
            self.counters
                .lock()
                .unwrap()
                .get(name.as_str())
                .map(|t| t.0.load(std::sync::atomic::Ordering::SeqCst))
                .unwrap_or(0)
        }
    }

    impl ::metrics::Recorder for CountingRecorder {
        fn describe_counter(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_gauge(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_histogram(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn register_counter(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Counter {
            let tally = self
                .counters
                .lock()
                .unwrap()
                .entry(key.name().to_string())
                .or_default()
                .clone();
            ::metrics::Counter::from_arc(tally)
        }

        fn register_gauge(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Gauge {
            ::metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Histogram {
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_batch_counts_every_query() {
        let recorder = CountingRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            reconcile::batch_sent(3, 0.2);
            reconcile::batch_sent(2, 0.1);
        });
        assert_eq!(recorder.total(MetricName::ReconcileBatches), 2);
        assert_eq!(recorder.total(MetricName::ReconcileQueries), 5);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        pipeline::rows_extracted(3);
        link::foreign_key_resolved(2, 1);
        assert!(render().is_none());
    }
}
