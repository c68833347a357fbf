pub mod config;
pub mod dispatch;
pub mod error;
pub mod filters;
pub mod issues;
pub mod link;
pub mod logging;
pub mod mapping;
pub mod observability;
pub mod pipeline;
pub mod reconcile;
pub mod resolver;
pub mod sources;
pub mod spec;
pub mod table;

pub use config::load_project;
pub use error::{HarmonizeError, Result};
pub use issues::{IssueCode, Severity, ValidationIssue};
pub use pipeline::{CancellationToken, EntityState, Pipeline, RunMode, RunOptions, RunReport};
pub use spec::{EntitySpec, ProjectSpec};
pub use table::{EntityTable, FrozenTable};
