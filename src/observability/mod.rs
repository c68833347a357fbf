// Observability: metrics and logging

pub mod metrics;

pub use metrics::{init, render, MetricName};
pub use metrics::{link, pipeline, reconcile, registry};
