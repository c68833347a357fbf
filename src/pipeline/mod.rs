// Run orchestration: dependency levels, per-entity state machine, run report

pub mod orchestrator;
pub mod report;
pub mod stages;

pub use orchestrator::{CancellationToken, Pipeline, RunOptions};
pub use report::{EntityReport, EntityState, RunMode, RunReport};
